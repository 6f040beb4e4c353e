//! Utilities module - text processing, topic and profile extraction

pub mod profile_extractor;
pub mod text_utils;
pub mod topic_extractor;

pub use profile_extractor::{ProfileExtractor, ProfileHints};
pub use text_utils::{TextUtils, Token};
pub use topic_extractor::TopicExtractor;
