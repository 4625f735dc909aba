//! Local copy of directory records.
//!
//! The map itself is not synchronized. It lives behind the single reader/writer lock
//! owned by [`crate::Authorize`], which every reader and writer goes through.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{Record, RecordType};

/// How long a deleted record is remembered by default
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(300);

/// Latest known record per `(type, id)`. Deleted records stay as tombstones for
/// `tombstone_ttl` so a fetch that was in flight when the deletion arrived cannot
/// bring them back; after that they are swept on the next write.
#[derive(Debug, Clone)]
pub struct DataBrokerData {
    records: HashMap<RecordType, HashMap<String, Record>>,
    tombstone_ttl: Duration,
    // Oldest first.
    tombstones: VecDeque<Tombstone>,
}

#[derive(Debug, Clone)]
struct Tombstone {
    deleted_at: Instant,
    record_type: RecordType,
    id: String,
    version: u64,
}

impl Default for DataBrokerData {
    fn default() -> Self {
        Self::with_tombstone_ttl(DEFAULT_TOMBSTONE_TTL)
    }
}

impl DataBrokerData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tombstone_ttl(tombstone_ttl: Duration) -> Self {
        Self {
            records: HashMap::new(),
            tombstone_ttl,
            tombstones: VecDeque::new(),
        }
    }

    /// Live record for the key; tombstones read as absent.
    pub fn get(&self, record_type: RecordType, id: &str) -> Option<&Record> {
        self.entry(record_type, id).filter(|r| !r.deleted)
    }

    /// Whether anything, tombstones included, is cached for the key.
    pub fn contains(&self, record_type: RecordType, id: &str) -> bool {
        self.entry(record_type, id).is_some()
    }

    fn entry(&self, record_type: RecordType, id: &str) -> Option<&Record> {
        self.records.get(&record_type).and_then(|m| m.get(id))
    }

    /// Upserts `record` unless the cached copy is newer. Returns whether the cache changed.
    pub fn update(&mut self, record: Record) -> bool {
        self.update_at(record, Instant::now())
    }

    /// [`update`](Self::update) with an explicit clock reading.
    pub fn update_at(&mut self, record: Record, now: Instant) -> bool {
        self.sweep_tombstones(now);

        if record.data.record_type() != record.record_type {
            warn!(
                record_type = %record.record_type,
                id = %record.id,
                "ignoring record whose payload does not match its type"
            );
            return false;
        }
        let by_id = self.records.entry(record.record_type).or_default();
        if let Some(current) = by_id.get(&record.id) {
            if current.version > record.version {
                debug!(
                    record_type = %record.record_type,
                    id = %record.id,
                    cached = current.version,
                    incoming = record.version,
                    "ignoring stale record"
                );
                return false;
            }
            if *current == record {
                return false;
            }
        }
        if record.deleted {
            self.tombstones.push_back(Tombstone {
                deleted_at: now,
                record_type: record.record_type,
                id: record.id.clone(),
                version: record.version,
            });
        }
        by_id.insert(record.id.clone(), record);
        true
    }

    /// Inserts `record` only if nothing is cached for its key yet.
    pub fn insert_if_absent(&mut self, record: Record) -> bool {
        self.insert_if_absent_at(record, Instant::now())
    }

    pub fn insert_if_absent_at(&mut self, record: Record, now: Instant) -> bool {
        self.sweep_tombstones(now);
        if self.contains(record.record_type, &record.id) {
            return false;
        }
        self.update_at(record, now)
    }

    /// Drops tombstones older than the retention window. A key deleted again, or
    /// replaced by a live record since, keeps its newer entry.
    fn sweep_tombstones(&mut self, now: Instant) {
        while let Some(oldest) = self.tombstones.front() {
            if now.saturating_duration_since(oldest.deleted_at) < self.tombstone_ttl {
                break;
            }
            let Some(t) = self.tombstones.pop_front() else {
                break;
            };
            if let Some(by_id) = self.records.get_mut(&t.record_type) {
                let expired = by_id
                    .get(&t.id)
                    .is_some_and(|r| r.deleted && r.version == t.version);
                if expired {
                    by_id.remove(&t.id);
                    debug!(record_type = %t.record_type, id = %t.id, "dropped expired tombstone");
                }
            }
        }
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.records
            .values()
            .flat_map(|m| m.values())
            .filter(|r| !r.deleted)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live records of one type
    pub fn records(&self, record_type: RecordType) -> impl Iterator<Item = &Record> {
        self.records
            .get(&record_type)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|r| !r.deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_get() {
        let mut data = DataBrokerData::new();
        assert!(data.update(Record::session("s1", 1, "u1")));

        let got = data.get(RecordType::Session, "s1").expect("should exist");
        assert_eq!(got.user_id(), Some("u1"));
        assert!(data.get(RecordType::User, "s1").is_none());
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn test_repeated_get_returns_same_record() {
        let mut data = DataBrokerData::new();
        data.update(Record::user("u1", 1, "alice@example.com", vec![]));

        let first = data.get(RecordType::User, "u1").unwrap() as *const Record;
        let second = data.get(RecordType::User, "u1").unwrap() as *const Record;
        assert_eq!(first, second);
    }

    #[test]
    fn test_older_version_does_not_regress() {
        let mut data = DataBrokerData::new();
        data.update(Record::user("u1", 5, "new@example.com", vec![]));

        assert!(!data.update(Record::user("u1", 4, "old@example.com", vec![])));
        assert_eq!(data.get(RecordType::User, "u1").unwrap().version, 5);

        assert!(data.update(Record::user("u1", 6, "newer@example.com", vec![])));
        assert_eq!(data.get(RecordType::User, "u1").unwrap().version, 6);
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut data = DataBrokerData::new();
        assert!(data.update(Record::session("s1", 2, "u1")));
        assert!(!data.update(Record::session("s1", 2, "u1")));
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn test_insert_if_absent_keeps_existing() {
        let mut data = DataBrokerData::new();
        data.update(Record::session("s1", 9, "streamed"));

        assert!(!data.insert_if_absent(Record::session("s1", 3, "fetched")));
        assert_eq!(data.get(RecordType::Session, "s1").unwrap().user_id(), Some("streamed"));

        assert!(data.insert_if_absent(Record::session("s2", 3, "fetched")));
        assert_eq!(data.get(RecordType::Session, "s2").unwrap().user_id(), Some("fetched"));
    }

    #[test]
    fn test_tombstone_blocks_fetch_reinsert() {
        let mut data = DataBrokerData::new();
        data.update(Record::session("s1", 1, "u1"));
        data.update(Record::session("s1", 1, "u1").into_tombstone(2));

        assert!(data.get(RecordType::Session, "s1").is_none());
        assert!(data.contains(RecordType::Session, "s1"));
        assert!(!data.insert_if_absent(Record::session("s1", 1, "u1")));
        assert!(data.get(RecordType::Session, "s1").is_none());
        assert!(data.is_empty());
    }

    #[test]
    fn test_mismatched_payload_ignored() {
        let mut data = DataBrokerData::new();
        let mut record = Record::session("s1", 1, "u1");
        record.record_type = RecordType::User;
        assert!(!data.update(record));
        assert!(data.is_empty());
    }

    #[test]
    fn test_records_by_type() {
        let mut data = DataBrokerData::new();
        data.update(Record::user("u1", 1, "a@example.com", vec![]));
        data.update(Record::user("u2", 1, "b@example.com", vec![]));
        data.update(Record::session("s1", 1, "u1"));

        assert_eq!(data.records(RecordType::User).count(), 2);
        assert_eq!(data.records(RecordType::ServiceAccount).count(), 0);
    }

    #[test]
    fn test_live_tombstone_blocks_fetch_until_expired() {
        let ttl = Duration::from_secs(60);
        let mut data = DataBrokerData::with_tombstone_ttl(ttl);
        let t0 = Instant::now();
        data.update_at(Record::session("s1", 1, "u1"), t0);
        data.update_at(Record::session("s1", 1, "u1").into_tombstone(2), t0);

        // Still inside the window: a late fetch result is rejected.
        let t1 = t0 + Duration::from_secs(59);
        assert!(!data.insert_if_absent_at(Record::session("s1", 1, "u1"), t1));
        assert!(data.contains(RecordType::Session, "s1"));
        assert!(data.get(RecordType::Session, "s1").is_none());

        // Past the window the tombstone is swept on the next write.
        let t2 = t0 + ttl;
        data.update_at(Record::user("u9", 1, "x@example.com", vec![]), t2);
        assert!(!data.contains(RecordType::Session, "s1"));
        assert!(data.tombstones.is_empty());
    }

    #[test]
    fn test_sweep_keeps_newer_state_for_key() {
        let ttl = Duration::from_secs(10);
        let mut data = DataBrokerData::with_tombstone_ttl(ttl);
        let t0 = Instant::now();
        data.update_at(Record::user("u1", 1, "a@example.com", vec![]).into_tombstone(1), t0);
        // Recreated with a higher version before the tombstone expires.
        data.update_at(Record::user("u1", 2, "a@example.com", vec![]), t0 + Duration::from_secs(1));

        data.update_at(Record::session("s1", 1, "u1"), t0 + ttl * 2);
        assert_eq!(data.get(RecordType::User, "u1").unwrap().version, 2);
    }
}
