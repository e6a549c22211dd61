//! RocksDB-backed message store.
//!
//! Column families:
//! - `messages`: bincode-encoded [`StoredMessage`]s keyed by
//!   `<room key><0x00><sequence: 8 bytes big-endian>`
//! - `meta`: store counters (`next_sequence`)
//!
//! A history page is one reverse scan from the end of the room's key
//! range, so the newest message comes first and the scan stops after
//! `limit` entries.
//!
//! The synchronous methods block on disk. Through [`MessageStore`] every
//! call runs on tokio's blocking pool, so callers can bound it with a
//! timeout and runtime workers keep serving other connections.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{HistoryQuery, MessageStore, NewChatMessage, StoreError, StoredMessage};
use crate::error::CollaboratorError;

const CF_MESSAGES: &str = "messages";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_META];

const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";

/// Separates the room key from the sequence in message keys.
const KEY_SEPARATOR: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("feed_chat_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Durable message store. Clones share the same database.
#[derive(Clone)]
pub struct RocksMessageStore {
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: Arc<StoreConfig>,
    /// Next sequence; held across the batch write so that the persisted
    /// counter only moves forward.
    next_sequence: Arc<Mutex<u64>>,
}

impl RocksMessageStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next_sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened message store at {} (next sequence {next_sequence})",
            config.path.display()
        );

        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
            next_sequence: Arc::new(Mutex::new(next_sequence)),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_MESSAGES => {
                // Append-heavy, range-scanned per room
                opts.set_max_write_buffer_number(4);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_META)
            .ok_or(StoreError::MissingColumnFamily(CF_META))?;
        match db.get_cf(cf, META_NEXT_SEQUENCE)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_be_bytes(buf))
            }
            Some(bytes) => Err(StoreError::DeserializationError(format!(
                "next_sequence has {} bytes, expected 8",
                bytes.len()
            ))),
            None => Ok(0),
        }
    }

    /// Persist one message and advance the sequence in a single batch.
    pub fn append_message(&self, message: NewChatMessage) -> Result<StoredMessage, StoreError> {
        let cf_messages = self.cf(CF_MESSAGES)?;
        let cf_meta = self.cf(CF_META)?;

        let mut next = self
            .next_sequence
            .lock()
            .map_err(|_| StoreError::DatabaseError("sequence lock poisoned".into()))?;
        let stored = StoredMessage::from_new(message, *next);
        let value = encode(&stored)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_messages, Self::message_key(&stored.room_key, stored.sequence), &value);
        batch.put_cf(cf_meta, META_NEXT_SEQUENCE, (stored.sequence + 1).to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        *next += 1;
        Ok(stored)
    }

    /// Up to `limit` messages of a room, newest first.
    pub fn load_history(&self, room_key: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        let prefix = Self::room_prefix(room_key);
        let end_key = Self::message_key(room_key, u64::MAX);

        let mut page = Vec::with_capacity(limit.min(256));
        if limit == 0 {
            return Ok(page);
        }

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&end_key, Direction::Reverse));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            // Another room whose key extends this one with a NUL byte.
            if key.len() != prefix.len() + 8 {
                continue;
            }
            page.push(decode(&value)?);
            if page.len() == limit {
                break;
            }
        }
        Ok(page)
    }

    /// Number of messages stored for a room.
    pub fn room_len(&self, room_key: &str) -> Result<usize, StoreError> {
        let cf = self.cf(CF_MESSAGES)?;
        let prefix = Self::room_prefix(room_key);
        let mut count = 0;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key.len() == prefix.len() + 8 {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.lock().map(|n| *n).unwrap_or_default()
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn room_prefix(room_key: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(room_key.len() + 1);
        prefix.extend_from_slice(room_key.as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    fn message_key(room_key: &str, sequence: u64) -> Vec<u8> {
        let mut key = Self::room_prefix(room_key);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }
}

#[async_trait]
impl MessageStore for RocksMessageStore {
    async fn append(&self, message: NewChatMessage) -> Result<StoredMessage, CollaboratorError> {
        let store = self.clone();
        run_blocking(move || store.append_message(message)).await
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<StoredMessage>, CollaboratorError> {
        let store = self.clone();
        let room_key = query.room_key.clone();
        let limit = query.limit;
        run_blocking(move || store.load_history(&room_key, limit)).await
    }
}

/// Run a store operation on the blocking pool.
///
/// If the awaiting future is dropped (e.g. on timeout) the operation still
/// runs to completion; an append is never half-applied.
pub(crate) async fn run_blocking<T, F>(op: F) -> Result<T, CollaboratorError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(result) => Ok(result?),
        Err(e) => Err(CollaboratorError::unavailable(
            "message store",
            format!("store task failed: {e}"),
        )),
    }
}

fn encode(message: &StoredMessage) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<StoredMessage, StoreError> {
    let (message, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(message)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Identity;
    use chrono::Utc;

    fn open_temp() -> (tempfile::TempDir, RocksMessageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksMessageStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    fn new_message(room: &str, content: &str) -> NewChatMessage {
        NewChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            sender: Identity::new("u1", "alice"),
            room_key: room.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert_eq!(store.next_sequence(), 0);
    }

    #[test]
    fn test_append_and_load() {
        let (_dir, store) = open_temp();
        let sent = new_message("u1:u2", "hello");
        let stored = store.append_message(sent.clone()).unwrap();

        assert_eq!(stored.sequence, 0);
        assert_eq!(stored.id, sent.id);

        let page = store.load_history("u1:u2", 10).unwrap();
        assert_eq!(page, vec![stored]);
    }

    #[test]
    fn test_history_newest_first_and_bounded() {
        let (_dir, store) = open_temp();
        for i in 0..20 {
            store.append_message(new_message("lobby", &format!("m{i}"))).unwrap();
        }

        let page = store.load_history("lobby", 5).unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m19", "m18", "m17", "m16", "m15"]);
        assert!(page.windows(2).all(|w| w[0].sequence > w[1].sequence));
    }

    #[test]
    fn test_history_limit_zero() {
        let (_dir, store) = open_temp();
        store.append_message(new_message("lobby", "m")).unwrap();
        assert!(store.load_history("lobby", 0).unwrap().is_empty());
    }

    #[test]
    fn test_room_isolation() {
        let (_dir, store) = open_temp();
        store.append_message(new_message("a", "in a")).unwrap();
        store.append_message(new_message("ab", "in ab")).unwrap();
        store.append_message(new_message("a\0b", "in a-nul-b")).unwrap();
        store.append_message(new_message("b", "in b")).unwrap();

        let page = store.load_history("a", 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "in a");
        assert_eq!(store.room_len("a").unwrap(), 1);
        assert_eq!(store.room_len("ab").unwrap(), 1);
        assert!(store.load_history("c", 10).unwrap().is_empty());
    }

    #[test]
    fn test_sequence_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksMessageStore::open(StoreConfig::for_testing(&path)).unwrap();
            for i in 0..3 {
                store.append_message(new_message("lobby", &format!("m{i}"))).unwrap();
            }
            store.flush().unwrap();
        }

        let store = RocksMessageStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.next_sequence(), 3);
        let stored = store.append_message(new_message("lobby", "after")).unwrap();
        assert_eq!(stored.sequence, 3);
        assert_eq!(store.load_history("lobby", 1).unwrap()[0].content, "after");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_message_store_trait_round_trip() {
        let (_dir, store) = open_temp();
        let shared: &dyn MessageStore = &store;
        for i in 0..3 {
            shared.append(new_message("u1:u2", &format!("m{i}"))).await.unwrap();
        }

        let page = shared
            .history(&HistoryQuery {
                room_key: "u1:u2".into(),
                limit: 2,
            })
            .await
            .unwrap();
        let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m1"]);
        assert_eq!(store.next_sequence(), 3);
    }

    #[tokio::test]
    async fn test_blocking_work_does_not_defeat_timeout() {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            run_blocking(|| {
                std::thread::sleep(std::time::Duration::from_millis(800));
                Ok(())
            }),
        )
        .await;

        assert!(result.is_err(), "timeout should fire before the work finishes");
        assert!(started.elapsed() < std::time::Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_blocking_store_error_is_collaborator_error() {
        let result: Result<(), _> =
            run_blocking(|| Err(StoreError::DatabaseError("io error".into()))).await;
        assert!(matches!(result, Err(CollaboratorError::Store(StoreError::DatabaseError(_)))));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode(&[0xFF, 0xFE, 0xFD]),
            Err(StoreError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("feed_chat_data"));
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
