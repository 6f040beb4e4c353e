// memory-router/src/config.rs

use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::router::ollama::{DEFAULT_OLLAMA_URL, DEFAULT_ROUTER_MODEL};
use crate::router::registry::{DEFAULT_MAX_CLASSES, DEFAULT_MAX_EXAMPLES};
use crate::router::SchemaLimits;

/// Which classification backend the router uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierKind {
    Keyword,
    Ollama,
}

impl FromStr for ClassifierKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "keyword" => Ok(ClassifierKind::Keyword),
            "ollama" => Ok(ClassifierKind::Ollama),
            other => Err(anyhow!("unknown classifier backend: {} (expected keyword or ollama)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub database_path: PathBuf,
    pub database_pool_size: u32,
    pub sweep_interval_seconds: u64,
    /// Live system entry bound; 0 disables pressure eviction.
    pub memory_capacity: usize,
    pub router_max_classes: usize,
    pub router_max_examples: usize,
    pub context_timeout_ms: u64,
    pub context_messages: usize,
    pub max_concurrent_requests: usize,
    pub request_timeout_seconds: u64,
    pub classifier_backend: ClassifierKind,
    pub ollama_base_url: String,
    pub router_model: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source. Unset variables take their defaults;
    /// set but unparseable ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| -> String {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        fn parse<T>(name: &str, raw: String) -> Result<T>
        where
            T: FromStr,
            T::Err: std::fmt::Display,
        {
            raw.parse::<T>()
                .map_err(|e| anyhow!("{}", e))
                .with_context(|| format!("invalid value for {}: {:?}", name, raw))
        }

        let database_pool_size = match var("DATABASE_POOL_SIZE", "auto").as_str() {
            "auto" => Self::auto_detect_pool_size(),
            raw => parse("DATABASE_POOL_SIZE", raw.to_string())?,
        };
        let max_concurrent_requests = match var("MAX_CONCURRENT_REQUESTS", "auto").as_str() {
            "auto" => Self::auto_detect_concurrency(),
            raw => parse("MAX_CONCURRENT_REQUESTS", raw.to_string())?,
        };

        let config = Self {
            api_host: var("API_HOST", "127.0.0.1"),
            api_port: parse("API_PORT", var("API_PORT", "8000"))?,
            database_path: PathBuf::from(var("DATABASE_PATH", "./data/memory.db")),
            database_pool_size,
            sweep_interval_seconds: parse("SWEEP_INTERVAL_SECONDS", var("SWEEP_INTERVAL_SECONDS", "60"))?,
            memory_capacity: parse("MEMORY_CAPACITY", var("MEMORY_CAPACITY", "0"))?,
            router_max_classes: parse(
                "ROUTER_MAX_CLASSES",
                var("ROUTER_MAX_CLASSES", &DEFAULT_MAX_CLASSES.to_string()),
            )?,
            router_max_examples: parse(
                "ROUTER_MAX_EXAMPLES",
                var("ROUTER_MAX_EXAMPLES", &DEFAULT_MAX_EXAMPLES.to_string()),
            )?,
            context_timeout_ms: parse("CONTEXT_TIMEOUT_MS", var("CONTEXT_TIMEOUT_MS", "250"))?,
            context_messages: parse("CONTEXT_MESSAGES", var("CONTEXT_MESSAGES", "5"))?,
            max_concurrent_requests,
            request_timeout_seconds: parse(
                "REQUEST_TIMEOUT_SECONDS",
                var("REQUEST_TIMEOUT_SECONDS", "30"),
            )?,
            classifier_backend: parse("CLASSIFIER_BACKEND", var("CLASSIFIER_BACKEND", "keyword"))?,
            ollama_base_url: var("OLLAMA_BASE_URL", DEFAULT_OLLAMA_URL),
            router_model: var("ROUTER_MODEL", DEFAULT_ROUTER_MODEL),
        };

        if config.database_pool_size == 0 {
            return Err(anyhow!("DATABASE_POOL_SIZE must be at least 1"));
        }
        if config.max_concurrent_requests == 0 {
            return Err(anyhow!("MAX_CONCURRENT_REQUESTS must be at least 1"));
        }
        if config.sweep_interval_seconds == 0 {
            warn!("SWEEP_INTERVAL_SECONDS is 0; the reaper runs at its 1s minimum");
        }
        Ok(config)
    }

    fn auto_detect_pool_size() -> u32 {
        let cpus = num_cpus::get() as u32;
        let size = cpus.clamp(2, 16);
        info!("Auto-detected CPU cores: {}, database pool size {}", cpus, size);
        size
    }

    fn auto_detect_concurrency() -> usize {
        (num_cpus::get() * 32).clamp(32, 1024)
    }

    pub fn schema_limits(&self) -> SchemaLimits {
        SchemaLimits {
            max_classes: self.router_max_classes,
            max_examples: self.router_max_examples,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Database: {} (pool {})", self.database_path.display(), self.database_pool_size);
        info!("- Sweep Interval: {}s", self.sweep_interval_seconds);
        if self.memory_capacity == 0 {
            info!("- Memory Capacity: unbounded");
        } else {
            info!("- Memory Capacity: {} system entries", self.memory_capacity);
        }
        info!(
            "- Router Limits: {} classes, {} examples",
            self.router_max_classes, self.router_max_examples
        );
        info!(
            "- Context: {} messages within {}ms",
            self.context_messages, self.context_timeout_ms
        );
        info!("- Max Concurrent Requests: {}", self.max_concurrent_requests);
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        match self.classifier_backend {
            ClassifierKind::Keyword => info!("- Classifier: keyword"),
            ClassifierKind::Ollama => info!(
                "- Classifier: ollama at {} ({})",
                self.ollama_base_url, self.router_model
            ),
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}
