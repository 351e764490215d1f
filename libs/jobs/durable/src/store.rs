//! Three-table job store.
//!
//! Each operation is one short write transaction, so a job is always in
//! exactly one table and counters can be derived from table sizes after a
//! crash.

use chrono::{DateTime, SecondsFormat, Utc};
use jobs::JobsError;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PUSH: TableDefinition<&str, &[u8]> = TableDefinition::new("push");
const IN_QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("in_queue");
const DELAY: TableDefinition<&str, &[u8]> = TableDefinition::new("delay");

/// Separates the release time from the job id in `delay` keys
const KEY_SEPARATOR: char = '|';

/// Key of a delayed job. RFC 3339 with fixed nanosecond precision sorts
/// lexicographically in time order.
pub fn release_key(at: DateTime<Utc>, job_id: &str) -> String {
    format!(
        "{}{KEY_SEPARATOR}{job_id}",
        at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
}

fn parse_release_key(key: &str) -> Option<(DateTime<Utc>, &str)> {
    let (at, id) = key.split_once(KEY_SEPARATOR)?;
    let at = DateTime::parse_from_rfc3339(at).ok()?.with_timezone(&Utc);
    Some((at, id))
}

trait OrStorage<T> {
    fn or_storage(self) -> Result<T, JobsError>;
}

impl<T, E: Into<redb::Error>> OrStorage<T> for Result<T, E> {
    fn or_storage(self) -> Result<T, JobsError> {
        self.map_err(|e| JobsError::storage(e.into().to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub push: u64,
    pub in_queue: u64,
    pub delay: u64,
}

pub struct DelayStore {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for DelayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayStore").field("path", &self.path).finish()
    }
}

impl DelayStore {
    /// Open or create the database file. `permissions` is the unix mode the
    /// file is created with.
    pub fn open(path: impl AsRef<Path>, permissions: u32) -> Result<Self, JobsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| JobsError::storage(format!("{}: {e}", parent.display())))?;
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(permissions);
        }
        #[cfg(not(unix))]
        let _ = permissions;

        let file = options
            .open(path)
            .map_err(|e| JobsError::storage(format!("{}: {e}", path.display())))?;
        let db = Database::builder().create_file(file).or_storage()?;

        let txn = db.begin_write().or_storage()?;
        {
            txn.open_table(PUSH).or_storage()?;
            txn.open_table(IN_QUEUE).or_storage()?;
            txn.open_table(DELAY).or_storage()?;
        }
        txn.commit().or_storage()?;

        debug!(path = %path.display(), "job store opened");
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move every `in_queue` entry back to `push`
    pub fn recover(&self) -> Result<u64, JobsError> {
        let txn = self.db.begin_write().or_storage()?;
        let moved = {
            let mut in_queue = txn.open_table(IN_QUEUE).or_storage()?;
            let mut push = txn.open_table(PUSH).or_storage()?;
            let mut moved = 0;
            loop {
                let (id, bytes) = match in_queue.pop_first().or_storage()? {
                    Some((id, bytes)) => (id.value().to_string(), bytes.value().to_vec()),
                    None => break,
                };
                push.insert(id.as_str(), bytes.as_slice()).or_storage()?;
                moved += 1;
            }
            moved
        };
        txn.commit().or_storage()?;
        Ok(moved)
    }

    /// Store a job that is ready now. An id that is already waiting in
    /// `push` or reserved in `in_queue` is rejected, the stored job is kept.
    pub fn push(&self, job_id: &str, bytes: &[u8]) -> Result<(), JobsError> {
        let txn = self.db.begin_write().or_storage()?;
        let duplicate = {
            let mut push = txn.open_table(PUSH).or_storage()?;
            let in_queue = txn.open_table(IN_QUEUE).or_storage()?;
            let taken = push.get(job_id).or_storage()?.is_some()
                || in_queue.get(job_id).or_storage()?.is_some();
            if !taken {
                push.insert(job_id, bytes).or_storage()?;
            }
            taken
        };

        if duplicate {
            txn.abort().or_storage()?;
            return Err(JobsError::DuplicateJob(job_id.to_string()));
        }
        txn.commit().or_storage()
    }

    /// Store a job that becomes ready at `release`
    pub fn delay(&self, release: DateTime<Utc>, job_id: &str, bytes: &[u8]) -> Result<(), JobsError> {
        let key = release_key(release, job_id);
        let txn = self.db.begin_write().or_storage()?;
        {
            let mut delay = txn.open_table(DELAY).or_storage()?;
            delay.insert(key.as_str(), bytes).or_storage()?;
        }
        txn.commit().or_storage()
    }

    /// Move up to `limit` ready jobs to `in_queue` and return them
    pub fn reserve(&self, limit: usize) -> Result<Vec<(String, Vec<u8>)>, JobsError> {
        let txn = self.db.begin_write().or_storage()?;
        let reserved = {
            let mut push = txn.open_table(PUSH).or_storage()?;
            let mut in_queue = txn.open_table(IN_QUEUE).or_storage()?;
            let mut reserved = Vec::new();
            while reserved.len() < limit {
                let (id, bytes) = match push.pop_first().or_storage()? {
                    Some((id, bytes)) => (id.value().to_string(), bytes.value().to_vec()),
                    None => break,
                };
                in_queue.insert(id.as_str(), bytes.as_slice()).or_storage()?;
                reserved.push((id, bytes));
            }
            reserved
        };

        if reserved.is_empty() {
            txn.abort().or_storage()?;
        } else {
            txn.commit().or_storage()?;
        }
        Ok(reserved)
    }

    /// Forget a reserved job. Returns whether it was still reserved.
    pub fn remove_reserved(&self, job_id: &str) -> Result<bool, JobsError> {
        let txn = self.db.begin_write().or_storage()?;
        let existed = {
            let mut in_queue = txn.open_table(IN_QUEUE).or_storage()?;
            in_queue.remove(job_id).or_storage()?.is_some()
        };
        txn.commit().or_storage()?;
        Ok(existed)
    }

    /// Put a reserved job back, ready now or at `release`
    pub fn requeue(
        &self,
        job_id: &str,
        bytes: &[u8],
        release: Option<DateTime<Utc>>,
    ) -> Result<(), JobsError> {
        let txn = self.db.begin_write().or_storage()?;
        {
            let mut in_queue = txn.open_table(IN_QUEUE).or_storage()?;
            in_queue.remove(job_id).or_storage()?;
            match release {
                None => {
                    let mut push = txn.open_table(PUSH).or_storage()?;
                    push.insert(job_id, bytes).or_storage()?;
                }
                Some(at) => {
                    let mut delay = txn.open_table(DELAY).or_storage()?;
                    delay
                        .insert(release_key(at, job_id).as_str(), bytes)
                        .or_storage()?;
                }
            }
        }
        txn.commit().or_storage()
    }

    /// Move every delayed job due at `now` to `push`. The scan stops at the
    /// first entry in the future.
    pub fn promote_due(&self, now: DateTime<Utc>) -> Result<u64, JobsError> {
        let txn = self.db.begin_write().or_storage()?;
        let promoted = {
            let mut delay = txn.open_table(DELAY).or_storage()?;
            let mut push = txn.open_table(PUSH).or_storage()?;

            let mut due = Vec::new();
            for entry in delay.iter().or_storage()? {
                let (key, bytes) = entry.or_storage()?;
                let key = key.value();
                match parse_release_key(key) {
                    Some((at, _)) if at > now => break,
                    Some(_) => due.push((key.to_string(), bytes.value().to_vec())),
                    None => {
                        // Unparseable keys would block the head forever
                        warn!(key = %key, "malformed delay key, releasing now");
                        due.push((key.to_string(), bytes.value().to_vec()));
                    }
                }
            }

            for (key, bytes) in &due {
                delay.remove(key.as_str()).or_storage()?;
                let id = parse_release_key(key).map_or(key.as_str(), |(_, id)| id);
                push.insert(id, bytes.as_slice()).or_storage()?;
            }
            due.len() as u64
        };

        if promoted == 0 {
            txn.abort().or_storage()?;
        } else {
            txn.commit().or_storage()?;
        }
        Ok(promoted)
    }

    pub fn counts(&self) -> Result<StoreCounts, JobsError> {
        let txn = self.db.begin_read().or_storage()?;
        Ok(StoreCounts {
            push: txn.open_table(PUSH).or_storage()?.len().or_storage()?,
            in_queue: txn.open_table(IN_QUEUE).or_storage()?.len().or_storage()?,
            delay: txn.open_table(DELAY).or_storage()?.len().or_storage()?,
        })
    }
}
