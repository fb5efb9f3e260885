// AgriNet Coordinator - Cross-link orchestration layer
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Non-volatile configuration store
//!
//! Records are fixed-size and always overwritten whole. Writes from the
//! control engine and the inbound loop go through one [`PersistQueue`]
//! worker so the store only ever has a single writer.

use crate::error::{CoordinatorError, Result};
use agrinet::{with_retry, RetryStrategy, MAX_GROUPS};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Size of a group configuration record
pub const GROUP_RECORD_LEN: usize = 20;
/// Size of the device configuration id record
pub const DEVICE_CONFIG_RECORD_LEN: usize = 1;
/// Size of a calibration record
pub const CALIBRATION_RECORD_LEN: usize = 4;

/// Soil sensor calibration point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationPoint {
    /// Reading in water
    Wet,
    /// Reading in dry air
    Dry,
}

/// Key of one persistent record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// Configuration of a group, 0-based index
    Group(u8),
    /// Configuration id of this device
    DeviceConfigId,
    /// Soil calibration value
    Calibration(CalibrationPoint),
}

impl StoreKey {
    /// Key of a 1-based group id
    pub fn for_group(group: u8) -> Option<Self> {
        agrinet::group_index(group).map(|i| StoreKey::Group(i as u8))
    }

    /// Fixed record length under this key
    pub fn record_len(&self) -> usize {
        match self {
            StoreKey::Group(_) => GROUP_RECORD_LEN,
            StoreKey::DeviceConfigId => DEVICE_CONFIG_RECORD_LEN,
            StoreKey::Calibration(_) => CALIBRATION_RECORD_LEN,
        }
    }

    fn file_name(&self) -> String {
        match self {
            StoreKey::Group(index) => format!("group_{}.bin", index),
            StoreKey::DeviceConfigId => "device_config.bin".to_string(),
            StoreKey::Calibration(CalibrationPoint::Wet) => "calibration_wet.bin".to_string(),
            StoreKey::Calibration(CalibrationPoint::Dry) => "calibration_dry.bin".to_string(),
        }
    }

    fn check(&self, bytes: &[u8]) -> Result<()> {
        if let StoreKey::Group(index) = self {
            if *index as usize >= MAX_GROUPS {
                return Err(CoordinatorError::GroupOutOfRange(index.saturating_add(1)));
            }
        }
        if bytes.len() != self.record_len() {
            return Err(CoordinatorError::Persistence(format!(
                "{:?}: record is {} bytes, expected {}",
                self,
                bytes.len(),
                self.record_len()
            )));
        }
        Ok(())
    }
}

/// Keyed record store
pub trait ConfigStore: Send + Sync {
    /// Read a record; `None` when it was never written
    fn read(&self, key: StoreKey) -> Result<Option<Vec<u8>>>;

    /// Overwrite a whole record
    fn write(&self, key: StoreKey, bytes: &[u8]) -> Result<()>;
}

/// In-memory store; clones share the same records
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<StoreKey, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether nothing was stored yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConfigStore for MemoryStore {
    fn read(&self, key: StoreKey) -> Result<Option<Vec<u8>>> {
        let records = self
            .records
            .lock()
            .map_err(|_| CoordinatorError::Persistence("store lock poisoned".to_string()))?;
        Ok(records.get(&key).cloned())
    }

    fn write(&self, key: StoreKey, bytes: &[u8]) -> Result<()> {
        key.check(bytes)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Persistence(format!(
                "write of {:?} refused",
                key
            )));
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| CoordinatorError::Persistence("store lock poisoned".to_string()))?;
        records.insert(key, bytes.to_vec());
        Ok(())
    }
}

/// One file per record in a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create) the store directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            CoordinatorError::Persistence(format!("{}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    /// Store directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: StoreKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl ConfigStore for FileStore {
    fn read(&self, key: StoreKey) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CoordinatorError::Persistence(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };
        if bytes.len() != key.record_len() {
            return Err(CoordinatorError::Persistence(format!(
                "{}: truncated record ({} bytes)",
                path.display(),
                bytes.len()
            )));
        }
        Ok(Some(bytes))
    }

    fn write(&self, key: StoreKey, bytes: &[u8]) -> Result<()> {
        key.check(bytes)?;
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| CoordinatorError::Persistence(format!("{}: {}", path.display(), e)))
    }
}

/// Read the device configuration id
pub fn load_device_config_id(store: &dyn ConfigStore) -> Result<Option<u8>> {
    Ok(store
        .read(StoreKey::DeviceConfigId)?
        .and_then(|r| r.first().copied()))
}

/// Write the device configuration id
pub fn save_device_config_id(store: &dyn ConfigStore, id: u8) -> Result<()> {
    store.write(StoreKey::DeviceConfigId, &[id])
}

/// Read a soil calibration value
pub fn load_calibration(store: &dyn ConfigStore, point: CalibrationPoint) -> Result<Option<i32>> {
    let Some(record) = store.read(StoreKey::Calibration(point))? else {
        return Ok(None);
    };
    let bytes: [u8; CALIBRATION_RECORD_LEN] = record.as_slice().try_into().map_err(|_| {
        CoordinatorError::Persistence(format!("calibration {:?}: bad record", point))
    })?;
    Ok(Some(i32::from_le_bytes(bytes)))
}

/// Write a soil calibration value
pub fn save_calibration(store: &dyn ConfigStore, point: CalibrationPoint, value: i32) -> Result<()> {
    store.write(StoreKey::Calibration(point), &value.to_le_bytes())
}

enum PersistRequest {
    Write { key: StoreKey, bytes: Vec<u8> },
    Flush(mpsc::Sender<()>),
    Shutdown,
}

/// Submission side of the persistence queue
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<PersistRequest>,
    failures: Arc<AtomicU64>,
}

impl PersistHandle {
    /// Queue a whole-record write
    pub fn submit(&self, key: StoreKey, bytes: Vec<u8>) {
        if self.tx.send(PersistRequest::Write { key, bytes }).is_err() {
            error!("Persistence queue closed, dropping write of {:?}", key);
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait until every write queued so far was attempted
    pub fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .send(PersistRequest::Flush(done_tx))
            .map_err(|_| CoordinatorError::Persistence("persistence queue closed".to_string()))?;
        done_rx
            .recv()
            .map_err(|_| CoordinatorError::Persistence("persistence worker stopped".to_string()))
    }

    /// Writes that failed after retries
    pub fn failed_writes(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Single-writer persistence worker
pub struct PersistQueue {
    handle: PersistHandle,
    worker: Option<thread::JoinHandle<()>>,
}

impl PersistQueue {
    /// Spawn the worker owning `store`
    pub fn spawn(store: Arc<dyn ConfigStore>) -> Result<Self> {
        Self::spawn_with_retry(store, RetryStrategy::fixed(2, Duration::from_millis(20)))
    }

    /// Spawn with a custom retry strategy for failed writes
    pub fn spawn_with_retry(store: Arc<dyn ConfigStore>, retry: RetryStrategy) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<PersistRequest>();
        let failures = Arc::new(AtomicU64::new(0));
        let worker_failures = Arc::clone(&failures);

        let worker = thread::Builder::new()
            .name("agrinet-persist".to_string())
            .spawn(move || {
                for request in rx {
                    match request {
                        PersistRequest::Write { key, bytes } => {
                            match with_retry(&retry, || store.write(key, &bytes)) {
                                Ok(()) => debug!("Persisted {:?}", key),
                                Err(e) => {
                                    error!("Persisting {:?} failed: {}", key, e);
                                    worker_failures.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        PersistRequest::Flush(done) => {
                            let _ = done.send(());
                        }
                        PersistRequest::Shutdown => break,
                    }
                }
            })
            .map_err(|e| CoordinatorError::Persistence(format!("spawn failed: {}", e)))?;

        Ok(Self {
            handle: PersistHandle { tx, failures },
            worker: Some(worker),
        })
    }

    /// A submission handle
    pub fn handle(&self) -> PersistHandle {
        self.handle.clone()
    }

    /// Drain pending writes and stop the worker
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.tx.send(PersistRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Persistence worker panicked");
            }
        }
    }
}

impl Drop for PersistQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
