//! The JSON document store backing the two databases, plus the advisory
//! lock used for leader election.
//!
//! The engine is transport-agnostic; this store is the transport the daemon
//! ships with. Each database is one JSON document; commits are atomic via
//! temp-file rename, and every southbound commit bumps a sequence number
//! the northbound `sb_cfg` is synchronized to.

use northd_engine::PassOutcome;
use northd_model::nb::Northbound;
use northd_model::ops::{apply_nb_ops, apply_sb_ops};
use northd_model::sb::Southbound;
use std::fs;
use std::hash::{DefaultHasher, Hash as _, Hasher as _};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access store file")]
    Io(#[from] io::Error),
    #[error("store file is not a valid database document")]
    Json(#[from] serde_json::Error),
}

pub struct Store {
    nb_path: PathBuf,
    sb_path: PathBuf,
    lock_path: PathBuf,
    lock_held: bool,
}

impl Store {
    pub fn new(nb_path: PathBuf, sb_path: PathBuf) -> Self {
        let lock_path = sb_path.with_extension("lock");

        Self {
            nb_path,
            sb_path,
            lock_path,
            lock_held: false,
        }
    }

    /// Loads a consistent snapshot of both databases. Missing files read as
    /// empty databases so a fresh deployment needs no seeding.
    pub fn load(&self) -> Result<(Northbound, Southbound), StoreError> {
        Ok((read_doc(&self.nb_path)?, read_doc(&self.sb_path)?))
    }

    /// A cheap digest over both documents, used to skip passes when nothing
    /// changed.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();

        for path in [&self.nb_path, &self.sb_path] {
            fs::read(path).unwrap_or_default().hash(&mut hasher);
        }

        hasher.finish()
    }

    /// Applies a pass outcome to the given snapshots and persists both
    /// documents in one go. Returns the committed southbound sequence
    /// number.
    ///
    /// On error nothing is guaranteed to have been written; the caller
    /// discards the snapshots and rebuilds from scratch.
    pub fn commit(
        &self,
        nb: &mut Northbound,
        sb: &mut Southbound,
        outcome: &PassOutcome,
    ) -> Result<i64, StoreError> {
        if !outcome.sb_ops.is_empty() {
            apply_sb_ops(sb, &outcome.sb_ops);
            sb.global.cfg += 1;
        }

        apply_nb_ops(nb, &outcome.nb_ops);
        nb.global.sb_cfg = sb.global.cfg;

        write_doc(&self.sb_path, sb)?;
        write_doc(&self.nb_path, nb)?;

        Ok(sb.global.cfg)
    }

    /// Attempts to take (or confirm) leadership.
    ///
    /// The lock is a file created exclusively, holding our pid. A lock left
    /// behind by a dead process is stolen.
    pub fn try_lock(&mut self) -> bool {
        if self.lock_held {
            return true;
        }

        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    self.lock_held = true;

                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if holder_is_alive(&self.lock_path) {
                        return false;
                    }

                    tracing::info!("Previous leader is gone; taking over its lock");
                    let _ = fs::remove_file(&self.lock_path);
                }
                Err(e) => {
                    tracing::warn!("Failed to acquire leadership lock: {e}");

                    return false;
                }
            }
        }

        false
    }

    pub fn release_lock(&mut self) {
        if self.lock_held {
            let _ = fs::remove_file(&self.lock_path);
            self.lock_held = false;
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.release_lock();
    }
}

fn holder_is_alive(lock_path: &Path) -> bool {
    let Some(pid) = fs::read_to_string(lock_path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
    else {
        // Unreadable or empty: treat as stale.
        return false;
    };

    if pid == std::process::id() {
        return false;
    }

    Path::new("/proc").join(pid.to_string()).exists()
}

fn read_doc<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_doc<T: serde::Serialize>(path: &Path, doc: &T) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(doc)?;

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use northd_model::ops::SbOp;

    fn store_in(dir: &tempfile::TempDir) -> Store {
        Store::new(dir.path().join("nb.json"), dir.path().join("sb.json"))
    }

    #[test]
    fn missing_files_read_as_empty_databases() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let (nb, sb) = store.load().unwrap();

        assert!(nb.switches.is_empty());
        assert!(sb.datapaths.is_empty());
    }

    #[test]
    fn commit_bumps_the_sequence_only_on_southbound_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let (mut nb, mut sb) = store.load().unwrap();

        let seq = store
            .commit(&mut nb, &mut sb, &PassOutcome::default())
            .unwrap();
        assert_eq!(seq, 0);

        let outcome = PassOutcome {
            sb_ops: vec![SbOp::SetNbCfg(7)],
            nb_ops: Vec::new(),
        };
        let seq = store.commit(&mut nb, &mut sb, &outcome).unwrap();

        assert_eq!(seq, 1);
        assert_eq!(nb.global.sb_cfg, 1);

        let (_, reloaded) = store.load().unwrap();
        assert_eq!(reloaded.global.nb_cfg, 7);
        assert_eq!(reloaded.global.cfg, 1);
    }

    #[test]
    fn digest_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let before = store.digest();

        let (mut nb, mut sb) = store.load().unwrap();
        let outcome = PassOutcome {
            sb_ops: vec![SbOp::SetNbCfg(1)],
            nb_ops: Vec::new(),
        };
        store.commit(&mut nb, &mut sb, &outcome).unwrap();

        assert_ne!(before, store.digest());
    }

    #[test]
    fn second_instance_cannot_take_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = store_in(&dir);
        let mut b = store_in(&dir);

        assert!(a.try_lock());
        assert!(!b.try_lock());

        // Leadership moves once the holder releases.
        a.release_lock();
        assert!(b.try_lock());
    }

    #[test]
    fn stale_lock_of_a_dead_process_is_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        // No live process has pid 0.
        fs::write(dir.path().join("sb.lock"), "0").unwrap();

        assert!(store.try_lock());
    }
}
