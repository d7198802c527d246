use super::StoreError;
use crate::alarm::AlarmMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Narrow get/set/subscribe access to the persisted alarm mode.
pub trait ModeStore: Send + Sync {
    fn get(&self) -> AlarmMode;

    fn set(&self, mode: AlarmMode) -> Result<(), StoreError>;

    /// Receiver notified whenever the stored mode changes.
    fn subscribe(&self) -> watch::Receiver<AlarmMode>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ModeFile {
    mode: AlarmMode,
}

/// Mode store backed by a small TOML file.
///
/// Writes go to a sibling temp file first and are then renamed over the
/// target, so a crash never leaves a half-written mode behind.
///
/// Inside a tokio runtime the file is written on the blocking pool and `set`
/// returns once subscribers are notified; write failures are logged. Outside
/// a runtime `set` writes before returning.
#[derive(Debug)]
pub struct FileModeStore {
    writer: Arc<ModeWriter>,
    mode_tx: watch::Sender<AlarmMode>,
    next_seq: AtomicU64,
}

#[derive(Debug)]
struct ModeWriter {
    path: PathBuf,
    /// Sequence number of the mode currently on disk.
    written: Mutex<u64>,
}

impl ModeWriter {
    /// Writes `mode` unless a newer `set` already reached the disk.
    fn write(&self, seq: u64, mode: AlarmMode) -> Result<(), StoreError> {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if *written > seq {
            debug!("Skipping stale mode write {} ({} already on disk)", seq, *written);
            return Ok(());
        }

        let content = toml::to_string_pretty(&ModeFile { mode })?;
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        *written = seq;
        Ok(())
    }
}

impl FileModeStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mode = Self::read_mode(&path)?;
        info!("Restored alarm mode {} from {}", mode, path.display());
        let (mode_tx, _) = watch::channel(mode);
        Ok(Self {
            writer: Arc::new(ModeWriter {
                path,
                written: Mutex::new(0),
            }),
            mode_tx,
            next_seq: AtomicU64::new(0),
        })
    }

    fn read_mode(path: &Path) -> Result<AlarmMode, StoreError> {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<ModeFile>(&content) {
                Ok(file) => Ok(file.mode),
                Err(e) => {
                    warn!(
                        "Mode file {} is unreadable ({}), falling back to {}",
                        path.display(),
                        e,
                        AlarmMode::default()
                    );
                    Ok(AlarmMode::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No mode file at {}, starting disarmed", path.display());
                Ok(AlarmMode::default())
            }
            Err(e) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.writer.path
    }
}

impl ModeStore for FileModeStore {
    fn get(&self) -> AlarmMode {
        *self.mode_tx.borrow()
    }

    fn set(&self, mode: AlarmMode) -> Result<(), StoreError> {
        self.mode_tx.send_if_modified(|current| {
            let changed = *current != mode;
            *current = mode;
            changed
        });

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let writer = Arc::clone(&self.writer);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    if let Err(e) = writer.write(seq, mode) {
                        error!("Failed to persist alarm mode {}: {}", mode, e);
                    }
                });
                Ok(())
            }
            Err(_) => writer.write(seq, mode),
        }
    }

    fn subscribe(&self) -> watch::Receiver<AlarmMode> {
        self.mode_tx.subscribe()
    }
}

/// In-memory store for hosts that persist elsewhere, and for tests.
#[derive(Debug)]
pub struct MemoryModeStore {
    mode_tx: watch::Sender<AlarmMode>,
}

impl MemoryModeStore {
    pub fn new(initial: AlarmMode) -> Self {
        let (mode_tx, _) = watch::channel(initial);
        Self { mode_tx }
    }
}

impl Default for MemoryModeStore {
    fn default() -> Self {
        Self::new(AlarmMode::default())
    }
}

impl ModeStore for MemoryModeStore {
    fn get(&self) -> AlarmMode {
        *self.mode_tx.borrow()
    }

    fn set(&self, mode: AlarmMode) -> Result<(), StoreError> {
        self.mode_tx.send_if_modified(|current| {
            let changed = *current != mode;
            *current = mode;
            changed
        });
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<AlarmMode> {
        self.mode_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_disarmed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileModeStore::open(dir.path().join("mode.toml")).unwrap();
        assert_eq!(store.get(), AlarmMode::Disarmed);
    }

    #[test]
    fn mode_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("mode.toml");

        let store = FileModeStore::open(&path).unwrap();
        store.set(AlarmMode::PendingAway).unwrap();
        drop(store);

        let reopened = FileModeStore::open(&path).unwrap();
        assert_eq!(reopened.get(), AlarmMode::PendingAway);
    }

    #[tokio::test]
    async fn runtime_writes_land_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mode.toml");
        let store = FileModeStore::open(&path).unwrap();

        let modes = [
            AlarmMode::ArmedHome,
            AlarmMode::PendingHome,
            AlarmMode::Triggered,
            AlarmMode::Disarmed,
            AlarmMode::ArmedAway,
        ];
        for mode in modes {
            store.set(mode).unwrap();
        }
        assert_eq!(store.get(), AlarmMode::ArmedAway);

        let mut on_disk = AlarmMode::Disarmed;
        for _ in 0..200 {
            on_disk = FileModeStore::read_mode(&path).unwrap();
            if on_disk == AlarmMode::ArmedAway {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(on_disk, AlarmMode::ArmedAway);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(FileModeStore::read_mode(&path).unwrap(), AlarmMode::ArmedAway);
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mode.toml");
        std::fs::write(&path, "mode = \"armed_night\"").unwrap();

        let store = FileModeStore::open(&path).unwrap();
        assert_eq!(store.get(), AlarmMode::Disarmed);
    }

    #[test]
    fn subscribers_see_changes_only() {
        let store = MemoryModeStore::default();
        let mut rx = store.subscribe();

        store.set(AlarmMode::Disarmed).unwrap();
        assert!(!rx.has_changed().unwrap());

        store.set(AlarmMode::ArmedHome).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), AlarmMode::ArmedHome);
    }
}
