//! Async memory store over the SQLite-backed database.
//!
//! Every operation runs its SQLite work on the blocking pool. Writes to the
//! same key are serialized through a per-key async mutex; different keys never
//! contend. Visibility of expired entries is enforced in SQL on every read, so
//! correctness never depends on the reaper having run.

pub mod expiry;
pub mod value;

use crate::error::{MemoryError, MemoryResult};
use crate::memory_db::{
    ts, ConversationUpdate, DatabaseStats, EntityKind, MemoryDatabase, MemoryRecord, Message,
    MessageRole, NewMessage, Page, Priority, PurgeReport, QuarantinedEntry, QueryFilter, SystemPut,
    UsageExtremes, User, UserUpdate,
};
use crate::metrics;
use crate::utils::ProfileExtractor;
use async_stream::try_stream;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub use expiry::{ExpiryEngine, SweepReport};
pub use value::{MemoryValue, ValueSchema, ValueSchemaRegistry, DEFAULT_MEMORY_TYPE, SYSTEM_PROMPT_TYPE};

pub const MAX_KEY_LEN: usize = 255;

/// Time source, replaceable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        use chrono::SubsecRound;
        Self {
            now: StdMutex::new(start.trunc_subsecs(6)),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

/// Write options. `ttl_seconds = 0` means no expiry; omitting both `ttl_seconds`
/// and `expires_at` clears any prior expiry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutOptions {
    pub ttl_seconds: Option<u64>,
    /// Absolute expiry. Mutually exclusive with `ttl_seconds`.
    pub expires_at: Option<DateTime<Utc>>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub memory_type: Option<String>,
}

impl PutOptions {
    pub fn ttl(seconds: u64) -> Self {
        Self {
            ttl_seconds: Some(seconds),
            ..Default::default()
        }
    }

    fn resolve_expiry(&self, now: &DateTime<Utc>) -> MemoryResult<Option<DateTime<Utc>>> {
        match (self.ttl_seconds, self.expires_at) {
            (Some(_), Some(_)) => Err(MemoryError::validation(
                "ttl_seconds and expires_at are mutually exclusive",
            )),
            (Some(0), None) | (None, None) => Ok(None),
            (Some(secs), None) => {
                let secs = i64::try_from(secs)
                    .map_err(|_| MemoryError::validation("ttl_seconds is too large"))?;
                let ttl = ChronoDuration::try_seconds(secs)
                    .ok_or_else(|| MemoryError::validation("ttl_seconds is too large"))?;
                let at = now
                    .checked_add_signed(ttl)
                    .ok_or_else(|| MemoryError::validation("ttl_seconds is too large"))?;
                check_storable(at, "ttl_seconds is too large").map(Some)
            }
            (None, Some(at)) => check_storable(at, "expires_at is out of range").map(Some),
        }
    }
}

/// Stored timestamps compare as text, which holds only for four-digit years.
fn check_storable(at: DateTime<Utc>, message: &str) -> MemoryResult<DateTime<Utc>> {
    if (0..=9999).contains(&at.year()) {
        Ok(at)
    } else {
        Err(MemoryError::validation(format!("{} (latest supported year is 9999)", message)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    #[serde(flatten)]
    pub database: DatabaseStats,
    #[serde(flatten)]
    pub usage: UsageExtremes,
    pub capacity: Option<usize>,
    pub last_sweep: Option<SweepReport>,
}

pub struct MemoryStore {
    db: Arc<MemoryDatabase>,
    values: ValueSchemaRegistry,
    key_locks: DashMap<(EntityKind, String), Arc<Mutex<()>>>,
    capacity: Option<usize>,
    clock: Arc<dyn Clock>,
    last_sweep: RwLock<Option<SweepReport>>,
    profiles: ProfileExtractor,
}

impl MemoryStore {
    pub fn new(db: Arc<MemoryDatabase>) -> Self {
        Self {
            db,
            values: ValueSchemaRegistry::default(),
            key_locks: DashMap::new(),
            capacity: None,
            clock: Arc::new(SystemClock),
            last_sweep: RwLock::new(None),
            profiles: ProfileExtractor::new(),
        }
    }

    /// In-memory store, for tests and embedding.
    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(MemoryDatabase::new_in_memory()?)))
    }

    /// Bound on live system entries; 0 disables pressure eviction.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = if capacity == 0 { None } else { Some(capacity) };
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Register or replace the value schema for a memory type.
    pub fn value_schemas(&self) -> &ValueSchemaRegistry {
        &self.values
    }

    /// Run synchronous database work off the async runtime.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> MemoryResult<T>
    where
        F: FnOnce(&MemoryDatabase, DateTime<Utc>) -> MemoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let now = self.now();
        tokio::task::spawn_blocking(move || f(&db, now)).await?
    }

    fn key_lock(&self, kind: EntityKind, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry((kind, key.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once no other writer holds a handle to it.
    fn release_key_lock(&self, kind: EntityKind, key: &str) {
        self.key_locks
            .remove_if(&(kind, key.to_string()), |_, lock| Arc::strong_count(lock) == 1);
    }

    pub(crate) async fn locked<T, F>(&self, kind: EntityKind, key: &str, f: F) -> MemoryResult<T>
    where
        F: FnOnce(&MemoryDatabase, DateTime<Utc>) -> MemoryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let lock = self.key_lock(kind, key);
        let result = {
            let _guard = lock.lock().await;
            self.blocking(f).await
        };
        drop(lock);
        self.release_key_lock(kind, key);
        result
    }

    /// Upsert an entry. Value shape depends on the entity type:
    /// users and conversations take an object of their mutable fields,
    /// system entries take any non-null value checked against the value
    /// schema registered for their memory type.
    pub async fn put(
        &self,
        kind: EntityKind,
        key: &str,
        value: Value,
        options: PutOptions,
    ) -> MemoryResult<MemoryRecord> {
        validate_key(key)?;
        let now = self.now();
        let expires_at = options.resolve_expiry(&now)?.map(|at| ts(&at));
        let key_owned = key.to_string();

        let record = match kind {
            EntityKind::User => {
                if expires_at.is_some() {
                    return Err(MemoryError::validation("users never expire; ttl is not accepted"));
                }
                reject_system_only(&options)?;
                let update: UserUpdate = decode_object(value, "user")?;
                self.locked(kind, key, move |db, now| {
                    db.users.put(&key_owned, update, &now).map(MemoryRecord::User)
                })
                .await?
            }
            EntityKind::Conversation => {
                reject_system_only(&options)?;
                let update: ConversationUpdate = decode_object(value, "conversation")?;
                let topics = normalize_tags(options.tags)?;
                self.locked(kind, key, move |db, now| {
                    db.conversations
                        .put(&key_owned, update, topics, expires_at, &now)
                        .map(MemoryRecord::Conversation)
                })
                .await?
            }
            EntityKind::System => {
                let value = MemoryValue::try_from(value)?;
                let memory_type = options
                    .memory_type
                    .unwrap_or_else(|| DEFAULT_MEMORY_TYPE.to_string());
                if memory_type.trim().is_empty() {
                    return Err(MemoryError::validation("memory_type must not be empty"));
                }
                self.values.validate(&memory_type, &value)?;
                let entry = SystemPut::new(key_owned.clone(), value)
                    .memory_type(memory_type)
                    .priority(options.priority.unwrap_or_default())
                    .tags(normalize_tags(options.tags)?)
                    .expires_at(expires_at);
                self.locked(kind, key, move |db, now| {
                    db.system.put(entry, &now).map(MemoryRecord::System)
                })
                .await?
            }
        };
        debug!("put {} {}", kind, key);
        Ok(record)
    }

    /// Logical read. NotFound if absent or expired; CorruptEntry if quarantined.
    pub async fn get(&self, kind: EntityKind, key: &str) -> MemoryResult<MemoryRecord> {
        let key = key.to_string();
        self.blocking(move |db, now| match kind {
            EntityKind::User => db.users.get(&key, &now).map(MemoryRecord::User),
            EntityKind::Conversation => db.conversations.get(&key, &now).map(MemoryRecord::Conversation),
            EntityKind::System => db.system.get(&key, &now).map(MemoryRecord::System),
        })
        .await
    }

    /// One page of live entries, newest first. Never touches access bookkeeping.
    pub async fn query(&self, kind: EntityKind, filter: QueryFilter) -> MemoryResult<Page<MemoryRecord>> {
        self.blocking(move |db, now| match kind {
            EntityKind::User => Ok(db.users.query(&filter, &now)?.map(MemoryRecord::User)),
            EntityKind::Conversation => Ok(db
                .conversations
                .query(&filter, &now)?
                .map(MemoryRecord::Conversation)),
            EntityKind::System => Ok(db.system.query(&filter, &now)?.map(MemoryRecord::System)),
        })
        .await
    }

    /// Lazily walk every page of a query.
    pub fn query_stream(
        self: &Arc<Self>,
        kind: EntityKind,
        filter: QueryFilter,
    ) -> impl Stream<Item = MemoryResult<MemoryRecord>> + Send + 'static {
        let store = Arc::clone(self);
        try_stream! {
            let mut filter = filter;
            loop {
                let page = store.query(kind, filter.clone()).await?;
                for record in page.entries {
                    yield record;
                }
                match page.next_cursor {
                    Some(cursor) => filter.cursor = Some(cursor),
                    None => break,
                }
            }
        }
    }

    /// Idempotent; deleting a conversation removes its messages in the same transaction.
    pub async fn delete(&self, kind: EntityKind, key: &str) -> MemoryResult<bool> {
        let key_owned = key.to_string();
        let removed = self
            .locked(kind, key, move |db, _| match kind {
                EntityKind::User => db.users.delete(&key_owned),
                EntityKind::Conversation => db.conversations.delete(&key_owned),
                EntityKind::System => db.system.delete(&key_owned),
            })
            .await?;
        if removed {
            debug!("deleted {} {}", kind, key);
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> MemoryResult<MemoryStats> {
        let (database, usage) = self
            .blocking(|db, now| {
                let now = ts(&now);
                Ok((db.get_stats(&now)?, db.usage_extremes(&now)?))
            })
            .await?;
        Ok(MemoryStats {
            database,
            usage,
            capacity: self.capacity,
            last_sweep: self.last_sweep.read().await.clone(),
        })
    }

    pub async fn touch_user(&self, id: &str) -> MemoryResult<User> {
        validate_key(id)?;
        let id_owned = id.to_string();
        self.locked(EntityKind::User, id, move |db, now| db.users.touch(&id_owned, &now))
            .await
    }

    pub async fn update_user_preferences(
        &self,
        id: &str,
        preferences: Map<String, Value>,
    ) -> MemoryResult<User> {
        validate_key(id)?;
        let id_owned = id.to_string();
        self.locked(EntityKind::User, id, move |db, now| {
            db.users.merge_preferences(&id_owned, preferences, &now)
        })
        .await
    }

    /// Returns the user and whether the fact was new.
    pub async fn add_user_fact(&self, id: &str, fact: &str) -> MemoryResult<(User, bool)> {
        validate_key(id)?;
        let id_owned = id.to_string();
        let fact = fact.to_string();
        self.locked(EntityKind::User, id, move |db, now| {
            db.users.add_fact(&id_owned, &fact, &now)
        })
        .await
    }

    pub async fn purge_user(&self, id: &str) -> MemoryResult<PurgeReport> {
        let id_owned = id.to_string();
        self.locked(EntityKind::User, id, move |db, _| db.users.purge(&id_owned))
            .await
    }

    pub async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> MemoryResult<Message> {
        validate_key(conversation_id)?;
        let id = conversation_id.to_string();
        let stored = self
            .locked(EntityKind::Conversation, conversation_id, move |db, now| {
                db.conversations.append_message(&id, message, &now)
            })
            .await?;
        if stored.role == MessageRole::User {
            self.learn_from_message(conversation_id, &stored.content).await;
        }
        Ok(stored)
    }

    /// Record facts and a reply-language preference a user states about
    /// themselves on the conversation's owner. Failures are logged, never returned.
    async fn learn_from_message(&self, conversation_id: &str, content: &str) {
        let hints = self.profiles.extract(content);
        if hints.is_empty() {
            return;
        }
        let id = conversation_id.to_string();
        let owner = match self.blocking(move |db, now| db.conversations.owner(&id, &now)).await {
            Ok(Some(owner)) => owner,
            Ok(None) => return,
            Err(e) => {
                debug!("No profile update for {}: {}", conversation_id, e);
                return;
            }
        };
        for fact in &hints.facts {
            if let Err(e) = self.add_user_fact(&owner, fact).await {
                debug!("Could not record fact for {}: {}", owner, e);
            }
        }
        if let Some(language) = hints.language {
            let mut preferences = Map::new();
            preferences.insert("language".to_string(), Value::from(language));
            if let Err(e) = self.update_user_preferences(&owner, preferences).await {
                debug!("Could not record language for {}: {}", owner, e);
            }
        }
    }

    /// Last `limit` messages, oldest first. Counts as a read of the conversation.
    pub async fn conversation_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> MemoryResult<Vec<Message>> {
        let id = conversation_id.to_string();
        self.blocking(move |db, now| db.conversations.messages(&id, limit, &now))
            .await
    }

    /// Last `n` messages without access bookkeeping.
    pub async fn recent_messages(&self, conversation_id: &str, n: usize) -> MemoryResult<Vec<Message>> {
        let id = conversation_id.to_string();
        self.blocking(move |db, now| db.conversations.recent_messages(&id, n, &now))
            .await
    }

    pub async fn quarantined(&self) -> MemoryResult<Vec<QuarantinedEntry>> {
        self.blocking(|db, _| db.quarantined()).await
    }

    pub async fn release_quarantined(&self, kind: EntityKind, key: &str) -> MemoryResult<bool> {
        let key_owned = key.to_string();
        self.locked(kind, key, move |db, _| db.release_quarantined(kind, &key_owned))
            .await
    }

    /// One full pass: TTL removal for conversations and system entries, then
    /// pressure eviction when a capacity is set. Per-entry failures are
    /// counted and logged; the pass continues.
    pub async fn sweep_now(&self) -> MemoryResult<SweepReport> {
        let started = Instant::now();
        let started_at = self.now();
        let now_s = ts(&started_at);
        let mut report = SweepReport {
            started_at: Some(started_at),
            ..Default::default()
        };

        for kind in [EntityKind::Conversation, EntityKind::System] {
            let list_now = now_s.clone();
            let keys = self
                .blocking(move |db, _| db.expired_keys(kind, &list_now))
                .await?;
            let mut removed = 0;
            for key in keys {
                let entry_now = now_s.clone();
                let entry_key = key.clone();
                match self
                    .locked(kind, &key, move |db, _| db.delete_expired(kind, &entry_key, &entry_now))
                    .await
                {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.errors += 1;
                        warn!("Failed to expire {} {}: {}", kind, key, e);
                    }
                }
            }
            metrics::inc_expired(kind.as_str(), removed);
            match kind {
                EntityKind::Conversation => report.expired_conversations = removed,
                _ => report.expired_system = removed,
            }
        }

        if self.capacity.is_some() {
            match self.evict_under_pressure().await {
                Ok((evicted, errors)) => {
                    report.evicted = evicted;
                    report.errors += errors;
                }
                Err(e) => {
                    report.errors += 1;
                    warn!("Pressure eviction failed: {}", e);
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        metrics::observe_sweep(started.elapsed().as_secs_f64());
        *self.last_sweep.write().await = Some(report.clone());
        Ok(report)
    }

    /// Evict system entries until the live count is within capacity. Returns
    /// `(evicted, errors)`; a no-op without a capacity or below it.
    pub async fn evict_under_pressure(&self) -> MemoryResult<(usize, usize)> {
        let capacity = match self.capacity {
            Some(capacity) => capacity,
            None => return Ok((0, 0)),
        };
        let (live, candidates) = self
            .blocking(|db, now| Ok((db.system.live_count(&now)?, db.system.eviction_candidates(&now)?)))
            .await?;
        let victims = expiry::select_victims(candidates, live, capacity);
        if victims.is_empty() {
            return Ok((0, 0));
        }
        info!(
            "Live system entries {} exceed capacity {}; evicting {}",
            live,
            capacity,
            victims.len()
        );

        let mut evicted = 0;
        let mut errors = 0;
        for victim in victims {
            let key = victim.key.clone();
            let seen = victim.updated_at;
            match self
                .locked(EntityKind::System, &victim.key, move |db, _| db.system.evict(&key, &seen))
                .await
            {
                Ok(true) => evicted += 1,
                Ok(false) => debug!("Skipped eviction of rewritten entry {}", victim.key),
                Err(e) => {
                    errors += 1;
                    warn!("Failed to evict {}: {}", victim.key, e);
                }
            }
        }
        metrics::inc_evicted(evicted);
        Ok((evicted, errors))
    }
}

fn validate_key(key: &str) -> MemoryResult<()> {
    if key.trim().is_empty() {
        return Err(MemoryError::validation("key must not be empty"));
    }
    if key.chars().count() > MAX_KEY_LEN {
        return Err(MemoryError::validation(format!(
            "key must be at most {} characters",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

fn reject_system_only(options: &PutOptions) -> MemoryResult<()> {
    if options.priority.is_some() || options.memory_type.is_some() {
        return Err(MemoryError::validation(
            "priority and memory_type apply to system entries only",
        ));
    }
    Ok(())
}

fn decode_object<T: serde::de::DeserializeOwned>(value: Value, entity: &str) -> MemoryResult<T> {
    if !value.is_object() {
        return Err(MemoryError::validation(format!("{} value must be an object", entity)));
    }
    serde_json::from_value(value)
        .map_err(|e| MemoryError::validation(format!("invalid {} value: {}", entity, e)))
}

fn normalize_tags(tags: Vec<String>) -> MemoryResult<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_string();
        if tag.is_empty() {
            return Err(MemoryError::validation("tags must not be empty"));
        }
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn store_with_clock() -> (Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryStore::in_memory()
            .unwrap()
            .with_clock(clock.clone());
        (Arc::new(store), clock)
    }

    #[tokio::test]
    async fn test_ttl_hides_entry_before_sweep() {
        let (store, clock) = store_with_clock();
        store
            .put(EntityKind::System, "session.hint", json!("short lived"), PutOptions::ttl(60))
            .await
            .unwrap();
        assert!(store.get(EntityKind::System, "session.hint").await.is_ok());

        clock.advance(ChronoDuration::seconds(60));
        assert!(store.get(EntityKind::System, "session.hint").await.unwrap_err().is_not_found());
        let page = store.query(EntityKind::System, QueryFilter::default()).await.unwrap();
        assert!(page.entries.is_empty());

        let report = store.sweep_now().await.unwrap();
        assert_eq!(report.expired_system, 1);
        assert_eq!(store.stats().await.unwrap().last_sweep.unwrap().expired_system, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_survives_sweeps() {
        let (store, clock) = store_with_clock();
        store
            .put(EntityKind::System, "forever", json!(1), PutOptions::ttl(0))
            .await
            .unwrap();
        clock.advance(ChronoDuration::days(3650));
        store.sweep_now().await.unwrap();
        assert!(store.get(EntityKind::System, "forever").await.is_ok());
    }

    #[tokio::test]
    async fn test_put_without_ttl_clears_prior_expiry() {
        let (store, clock) = store_with_clock();
        store
            .put(EntityKind::System, "k", json!("a"), PutOptions::ttl(5))
            .await
            .unwrap();
        store
            .put(EntityKind::System, "k", json!("b"), PutOptions::default())
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(10));
        match store.get(EntityKind::System, "k").await.unwrap() {
            MemoryRecord::System(entry) => {
                assert_eq!(entry.value, MemoryValue::from("b"));
                assert_eq!(entry.expires_at, None);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_past_expires_at_is_immediately_invisible() {
        let (store, clock) = store_with_clock();
        let options = PutOptions {
            expires_at: Some(clock.now() - ChronoDuration::seconds(1)),
            ..Default::default()
        };
        store.put(EntityKind::System, "gone", json!(true), options).await.unwrap();
        assert!(store.get(EntityKind::System, "gone").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_expiry_beyond_year_9999_is_rejected() {
        let (store, _) = store_with_clock();
        let err = store
            .put(EntityKind::System, "long", json!(1), PutOptions::ttl(400_000_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let year_10000 = chrono::NaiveDate::from_ymd_opt(10000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let options = PutOptions {
            expires_at: Some(chrono::TimeZone::from_utc_datetime(&Utc, &year_10000)),
            ..Default::default()
        };
        let err = store
            .put(EntityKind::Conversation, "c1", json!({}), options)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
        assert_eq!(store.stats().await.unwrap().database.conversations, 0);

        // About 7000 years out still fits.
        store
            .put(EntityKind::System, "long", json!(1), PutOptions::ttl(220_000_000_000))
            .await
            .unwrap();
        match store.get(EntityKind::System, "long").await.unwrap() {
            MemoryRecord::System(entry) => assert!(entry.expires_at.is_some()),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (store, _) = store_with_clock();
        let err = store
            .put(EntityKind::System, "  ", json!(1), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let err = store
            .put(EntityKind::System, "k", json!(null), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let err = store
            .put(EntityKind::User, "u", json!({}), PutOptions::ttl(10))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let both = PutOptions {
            ttl_seconds: Some(5),
            expires_at: Some(Utc::now()),
            ..Default::default()
        };
        assert!(store.put(EntityKind::System, "k", json!(1), both).await.is_err());

        let prompt = PutOptions {
            memory_type: Some(SYSTEM_PROMPT_TYPE.into()),
            ..Default::default()
        };
        let err = store
            .put(EntityKind::System, "p", json!({"title": "no content"}), prompt)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let err = store
            .put(EntityKind::User, "u", json!({"nickname": "x"}), PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_access_count_is_monotonic_and_query_does_not_touch() {
        let (store, _) = store_with_clock();
        store
            .put(EntityKind::User, "alice", json!({"display_name": "Alice"}), PutOptions::default())
            .await
            .unwrap();
        store.query(EntityKind::User, QueryFilter::default()).await.unwrap();
        let mut last = 0;
        for _ in 0..3 {
            let count = store.get(EntityKind::User, "alice").await.unwrap().access_count();
            assert!(count > last);
            last = count;
        }
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_cascades() {
        let (store, _) = store_with_clock();
        store.append_message("c1", NewMessage::user("hello there")).await.unwrap();
        assert!(store.delete(EntityKind::Conversation, "c1").await.unwrap());
        assert!(!store.delete(EntityKind::Conversation, "c1").await.unwrap());
        assert_eq!(store.stats().await.unwrap().database.messages, 0);
        assert!(store.conversation_messages("c1", 10).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_expired_conversation_sweep_removes_messages() {
        let (store, clock) = store_with_clock();
        store
            .put(EntityKind::Conversation, "c1", json!({"title": "t"}), PutOptions::ttl(30))
            .await
            .unwrap();
        store.append_message("c1", NewMessage::user("hello")).await.unwrap();
        clock.advance(ChronoDuration::seconds(31));
        let report = store.sweep_now().await.unwrap();
        assert_eq!(report.expired_conversations, 1);
        assert_eq!(store.stats().await.unwrap().database.messages, 0);
    }

    #[tokio::test]
    async fn test_reput_after_expiry_does_not_revive_transcript() {
        let (store, clock) = store_with_clock();
        store
            .put(EntityKind::Conversation, "c1", json!({}), PutOptions::ttl(10))
            .await
            .unwrap();
        store.append_message("c1", NewMessage::user("secret old text")).await.unwrap();
        clock.advance(ChronoDuration::seconds(11));
        assert!(store.get(EntityKind::Conversation, "c1").await.unwrap_err().is_not_found());

        match store
            .put(EntityKind::Conversation, "c1", json!({"title": "new"}), PutOptions::default())
            .await
            .unwrap()
        {
            MemoryRecord::Conversation(c) => {
                assert_eq!(c.message_count, 0);
                assert_eq!(c.total_tokens, 0);
                assert_eq!(c.access_count, 0);
                assert!(c.topics.is_empty());
                assert_eq!(c.expires_at, None);
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert!(store.conversation_messages("c1", 10).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().database.messages, 0);
    }

    #[tokio::test]
    async fn test_user_messages_update_owner_profile() {
        let (store, _) = store_with_clock();
        store
            .put(EntityKind::Conversation, "c1", json!({"user_id": "alice"}), PutOptions::default())
            .await
            .unwrap();
        store
            .append_message("c1", NewMessage::user("My name is Ada, I write Rust. Reply in English"))
            .await
            .unwrap();
        store
            .append_message("c1", NewMessage::assistant("Happy to help with Python and Docker"))
            .await
            .unwrap();

        match store.get(EntityKind::User, "alice").await.unwrap() {
            MemoryRecord::User(user) => {
                assert_eq!(user.facts.len(), 2);
                assert!(user.facts.contains(&"Name: Ada".to_string()));
                assert!(user.facts.contains(&"Interested in Rust programming".to_string()));
                assert_eq!(user.preferences["language"], json!("en"));
            }
            other => panic!("unexpected record {:?}", other),
        }

        // No owner, nothing to learn into.
        store.append_message("c2", NewMessage::user("call me Grace")).await.unwrap();
        assert_eq!(store.stats().await.unwrap().database.users, 1);
    }

    #[tokio::test]
    async fn test_pressure_eviction_respects_priority() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryStore::in_memory()
            .unwrap()
            .with_capacity(2)
            .with_clock(clock.clone());
        for (key, priority) in [
            ("low", Priority::Low),
            ("critical", Priority::Critical),
            ("high", Priority::High),
            ("medium", Priority::Medium),
        ] {
            let options = PutOptions {
                priority: Some(priority),
                ..Default::default()
            };
            store.put(EntityKind::System, key, json!(key), options).await.unwrap();
            clock.advance(ChronoDuration::seconds(1));
        }
        let report = store.sweep_now().await.unwrap();
        assert_eq!(report.evicted, 2);
        assert!(store.get(EntityKind::System, "critical").await.is_ok());
        assert!(store.get(EntityKind::System, "high").await.is_ok());
        assert!(store.get(EntityKind::System, "low").await.unwrap_err().is_not_found());
        assert!(store.get(EntityKind::System, "medium").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unexpired_entries_survive_sweep_without_capacity() {
        let (store, _) = store_with_clock();
        for i in 0..5 {
            store
                .put(EntityKind::System, &format!("k{}", i), json!(i), PutOptions::ttl(3600))
                .await
                .unwrap();
        }
        let report = store.sweep_now().await.unwrap();
        assert_eq!(report.removed(), 0);
        assert_eq!(store.stats().await.unwrap().database.system_entries, 5);
    }

    #[tokio::test]
    async fn test_query_stream_walks_all_pages() {
        let (store, clock) = store_with_clock();
        for i in 0..5 {
            store
                .put(EntityKind::System, &format!("k{}", i), json!(i), PutOptions::default())
                .await
                .unwrap();
            clock.advance(ChronoDuration::seconds(1));
        }
        let filter = QueryFilter {
            limit: Some(2),
            ..Default::default()
        };
        let keys: Vec<String> = store
            .query_stream(EntityKind::System, filter)
            .map(|r| r.unwrap().key().to_string())
            .collect()
            .await;
        assert_eq!(keys, vec!["k4", "k3", "k2", "k1", "k0"]);
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_key_are_serialized() {
        let (store, _) = store_with_clock();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.add_user_fact("shared", &format!("fact {}", i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        match store.get(EntityKind::User, "shared").await.unwrap() {
            MemoryRecord::User(user) => assert_eq!(user.facts.len(), 16),
            other => panic!("unexpected record {:?}", other),
        }
        assert!(store.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_expiry_engine_lifecycle() {
        let (store, _) = store_with_clock();
        let engine = ExpiryEngine::new(Arc::clone(&store), std::time::Duration::from_millis(10));
        assert_eq!(engine.interval(), expiry::MIN_SWEEP_INTERVAL);
        assert!(engine.start().await);
        assert!(!engine.start().await);
        assert!(engine.is_running().await);
        engine.stop().await;
        assert!(!engine.is_running().await);
        let report = engine.sweep_now().await.unwrap();
        assert_eq!(report.removed(), 0);
    }
}
