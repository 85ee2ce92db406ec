use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use tracing::{debug, info};

use super::backend::Backend;
use super::error::{StoreError, StoreResult};
use super::id;
use super::model::{encode_time, SecretRecord};

/// id -> encoded `SecretRecord`.
const VALUES: TableDefinition<&str, &[u8]> = TableDefinition::new("values");
/// `encode_time(created_at) || id` -> id.
const TIME_KEYS: TableDefinition<&str, &str> = TableDefinition::new("time_keys");

pub const DB_FILE_NAME: &str = "ephemera.redb";

/// Default wait for another handle to release the database file.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

const OPEN_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Leading byte of every encoded record; bumped if the layout changes.
const RECORD_VERSION: u8 = 0x01;

/// redb-backed store. The database file is opened for each operation and
/// closed again on every exit path.
///
/// Operations from this process queue on `gate` for the whole
/// open/transaction/close cycle, so the file lock retry in [`database`]
/// only ever waits on other processes.
///
/// [`database`]: DurableBackend::database
#[derive(Debug, Clone)]
pub struct DurableBackend {
    path: PathBuf,
    lock_timeout: Duration,
    gate: Arc<Mutex<()>>,
}

impl DurableBackend {
    /// Create `dir` if needed and make sure both tables exist in
    /// `dir/ephemera.redb`.
    pub fn open(dir: &Path, lock_timeout: Duration) -> StoreResult<Self> {
        create_private_dir(dir)?;

        let backend = Self {
            path: dir.join(DB_FILE_NAME),
            lock_timeout,
            gate: Arc::new(Mutex::new(())),
        };

        let db = backend.database()?;
        let write_txn = db.begin_write()?;
        write_txn.open_table(VALUES)?;
        write_txn.open_table(TIME_KEYS)?;
        write_txn.commit()?;

        info!(path = %backend.path.display(), "opened durable secret store");
        Ok(backend)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialise access from this process. Hold the guard until the
    /// `Database` handle has been dropped.
    fn enter(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the database file, waiting up to `lock_timeout` while another
    /// handle holds it.
    fn database(&self) -> StoreResult<Database> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    thread::sleep(OPEN_RETRY_DELAY);
                }
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(StoreError::BackendUnavailable(format!(
                        "timed out after {:?} waiting for lock on {}",
                        self.lock_timeout,
                        self.path.display()
                    )));
                }
                Err(e) => {
                    return Err(StoreError::BackendUnavailable(format!(
                        "open {}: {e}",
                        self.path.display()
                    )));
                }
            }
        }
    }
}

impl Backend for DurableBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn put(
        &self,
        ciphertext: &[u8],
        created_at: DateTime<Utc>,
        id_len: usize,
    ) -> StoreResult<String> {
        let _gate = self.enter();
        let db = self.database()?;
        let write_txn = db.begin_write()?;
        let id = {
            let mut values = write_txn.open_table(VALUES)?;
            let mut time_keys = write_txn.open_table(TIME_KEYS)?;

            let id = id::new_id(id_len, |candidate| Ok(values.get(candidate)?.is_some()))?;
            let record = SecretRecord {
                id: id.clone(),
                ciphertext: ciphertext.to_vec(),
                created_at,
            };

            let bytes = encode(&record)?;
            values.insert(id.as_str(), bytes.as_slice())?;
            time_keys.insert(record.time_key().as_str(), id.as_str())?;
            id
        };
        write_txn.commit()?;

        debug!(id = %id, "stored secret");
        Ok(id)
    }

    fn take(&self, id: &str) -> StoreResult<SecretRecord> {
        let _gate = self.enter();
        let db = self.database()?;
        let write_txn = db.begin_write()?;
        let record = {
            let mut values = write_txn.open_table(VALUES)?;

            // Copy out of the AccessGuard so its borrow of `values` ends here.
            let raw_bytes: Option<Vec<u8>> = values.remove(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => None,
                Some(bytes) => {
                    let record = decode(&bytes)?;
                    let mut time_keys = write_txn.open_table(TIME_KEYS)?;
                    time_keys.remove(record.time_key().as_str())?;
                    Some(record)
                }
            }
        };
        write_txn.commit()?;

        match record {
            Some(record) => {
                debug!(id = %id, "took secret");
                Ok(record)
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn sweep_expired(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        // Every key created before `cutoff` sorts at or below this bound; a
        // key created exactly at `cutoff` extends past it and survives.
        let bound = encode_time(cutoff);

        let _gate = self.enter();
        let db = self.database()?;
        let write_txn = db.begin_write()?;
        let removed = {
            let mut time_keys = write_txn.open_table(TIME_KEYS)?;
            let mut values = write_txn.open_table(VALUES)?;

            let mut expired: Vec<(String, String)> = Vec::new();
            for item in time_keys.range(..=bound.as_str())? {
                let (time_key, id) = item?;
                expired.push((time_key.value().to_owned(), id.value().to_owned()));
            }

            for (time_key, id) in &expired {
                values.remove(id.as_str())?;
                time_keys.remove(time_key.as_str())?;
            }
            expired.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "swept expired secrets");
        }
        Ok(removed)
    }
}

fn create_private_dir(dir: &Path) -> StoreResult<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| {
        StoreError::BackendUnavailable(format!("create storage dir {}: {e}", dir.display()))
    })
}

/// `[RECORD_VERSION] + bincode(record)`.
fn encode(record: &SecretRecord) -> StoreResult<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_VERSION);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> StoreResult<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_VERSION, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
            Ok(record)
        }
        Some((version, _)) => Err(StoreError::Codec(format!(
            "unknown record version {version:#04x}"
        ))),
        None => Err(StoreError::Codec("empty record".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn make_backend() -> (DurableBackend, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let backend = DurableBackend::open(&dir.path().join("data"), DEFAULT_LOCK_TIMEOUT).unwrap();
        (backend, dir)
    }

    /// Contents of both tables: (ids in `values`, (time_key, id) in `time_keys`).
    fn tables(backend: &DurableBackend) -> (Vec<String>, Vec<(String, String)>) {
        let db = backend.database().unwrap();
        let read_txn = db.begin_read().unwrap();

        let values = read_txn.open_table(VALUES).unwrap();
        let ids = values
            .iter()
            .unwrap()
            .map(|item| item.unwrap().0.value().to_owned())
            .collect();

        let time_keys = read_txn.open_table(TIME_KEYS).unwrap();
        let index = time_keys
            .iter()
            .unwrap()
            .map(|item| {
                let (k, v) = item.unwrap();
                (k.value().to_owned(), v.value().to_owned())
            })
            .collect();

        (ids, index)
    }

    fn assert_index_consistent(backend: &DurableBackend) {
        let (ids, index) = tables(backend);
        assert_eq!(ids.len(), index.len(), "orphaned entries: {ids:?} vs {index:?}");
        let ids: HashSet<_> = ids.into_iter().collect();
        for (time_key, id) in &index {
            assert!(ids.contains(id), "time key {time_key} points at missing {id}");
            assert!(time_key.ends_with(id.as_str()));
        }
    }

    #[test]
    fn put_take_removes_both_entries() {
        let (backend, _dir) = make_backend();
        let now = Utc::now();
        let id = backend.put(b"sealed", now, 8).unwrap();
        assert_index_consistent(&backend);
        assert_eq!(tables(&backend).0, vec![id.clone()]);

        let record = backend.take(&id).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.ciphertext, b"sealed");
        assert_eq!(record.created_at, now);

        let (ids, index) = tables(&backend);
        assert!(ids.is_empty());
        assert!(index.is_empty());
        assert!(matches!(backend.take(&id), Err(StoreError::NotFound)));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let backend = DurableBackend::open(dir.path(), DEFAULT_LOCK_TIMEOUT).unwrap();
            backend.put(b"persisted", Utc::now(), 8).unwrap()
        };
        let backend = DurableBackend::open(dir.path(), DEFAULT_LOCK_TIMEOUT).unwrap();
        assert_eq!(backend.take(&id).unwrap().ciphertext, b"persisted");
    }

    #[test]
    fn sweep_uses_time_index() {
        let (backend, _dir) = make_backend();
        let now = Utc::now();
        let cutoff = now - TimeDelta::hours(24);
        let stale = backend.put(b"old", now - TimeDelta::hours(30), 8).unwrap();
        let older = backend.put(b"older", now - TimeDelta::days(3), 8).unwrap();
        let fresh = backend.put(b"new", now - TimeDelta::hours(23), 8).unwrap();
        let at_cutoff = backend.put(b"edge", cutoff, 8).unwrap();

        assert_eq!(backend.sweep_expired(cutoff).unwrap(), 2);
        assert_index_consistent(&backend);

        assert!(matches!(backend.take(&stale), Err(StoreError::NotFound)));
        assert!(matches!(backend.take(&older), Err(StoreError::NotFound)));
        assert!(backend.take(&fresh).is_ok());
        assert!(backend.take(&at_cutoff).is_ok());

        assert_eq!(backend.sweep_expired(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn index_stays_consistent_across_mixed_operations() {
        let (backend, _dir) = make_backend();
        let now = Utc::now();
        let mut live = Vec::new();
        for i in 0..20 {
            let created = now - TimeDelta::hours(i * 3);
            live.push(backend.put(format!("v{i}").as_bytes(), created, 6).unwrap());
        }
        for id in live.iter().step_by(3) {
            backend.take(id).unwrap();
        }
        assert_index_consistent(&backend);

        backend.sweep_expired(now - TimeDelta::hours(24)).unwrap();
        assert_index_consistent(&backend);

        for id in &live {
            let _ = backend.take(id);
        }
        let (ids, index) = tables(&backend);
        assert!(ids.is_empty() && index.is_empty());
    }

    #[test]
    fn concurrent_puts_get_distinct_ids() {
        let (backend, _dir) = make_backend();
        let backend = Arc::new(backend);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let backend = Arc::clone(&backend);
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| backend.put(b"x", Utc::now(), 2).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 40);
        assert_index_consistent(&backend);
    }

    #[test]
    fn many_writers_queue_instead_of_timing_out() {
        let (backend, _dir) = make_backend();
        let backend = Arc::new(backend);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let backend = Arc::clone(&backend);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| backend.put(b"x", Utc::now(), 8))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let failed: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert!(failed.is_empty(), "{} of 800 puts failed: {:?}", failed.len(), failed.first());
        assert_eq!(tables(&backend).0.len(), 800);
        assert_index_consistent(&backend);
    }

    #[test]
    fn concurrent_takes_succeed_once() {
        let (backend, _dir) = make_backend();
        let backend = Arc::new(backend);
        let id = backend.put(b"once", Utc::now(), 8).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let backend = Arc::clone(&backend);
                let id = id.clone();
                std::thread::spawn(move || backend.take(&id))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, StoreError::NotFound)));
    }

    #[test]
    fn held_file_lock_times_out() {
        let dir = tempdir().unwrap();
        let backend = DurableBackend::open(dir.path(), std::time::Duration::from_millis(50)).unwrap();
        let _held = Database::create(backend.path()).unwrap();

        let started = Instant::now();
        let err = backend.put(b"x", Utc::now(), 8).unwrap_err();
        assert!(matches!(err, StoreError::BackendUnavailable(_)));
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
    }

    #[test]
    fn decode_rejects_unknown_version_and_empty() {
        assert!(matches!(decode(&[]), Err(StoreError::Codec(_))));
        assert!(matches!(decode(&[0x7f, 1, 2]), Err(StoreError::Codec(_))));
    }
}
