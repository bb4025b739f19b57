//! Durable recovery checkpoints.
//!
//! A handshake writes exactly one checkpoint, right after its deposit was created. It
//! holds the complete [Handshake] value and is read back only when a handshake starts,
//! to decide whether to resume at the refund signature exchange.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::exchange::ExchangeId;

use super::{api::Handshake, error::RecoveryError};

const CHECKPOINT_EXTENSION: &str = "cbor";

/// Storage of recovery checkpoints, one per exchange id.
pub trait RecoveryLog: Send + Sync {
    /// Store a checkpoint. Fails with [RecoveryError::AlreadyPersisted] if one exists.
    fn persist(&self, handshake: &Handshake) -> Result<(), RecoveryError>;

    fn load(&self, exchange_id: &ExchangeId) -> Result<Option<Handshake>, RecoveryError>;

    /// Ids of all stored checkpoints, sorted.
    fn list(&self) -> Result<Vec<ExchangeId>, RecoveryError>;
}

/// One CBOR file per exchange under `<data dir>/recovery`.
#[derive(Debug, Clone)]
pub struct FileRecoveryLog {
    dir: PathBuf,
}

impl FileRecoveryLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("recovery"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn checkpoint_path(&self, exchange_id: &ExchangeId) -> Result<PathBuf, RecoveryError> {
        let id = exchange_id.as_str();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(RecoveryError::InvalidExchangeId(id.to_string()));
        }
        Ok(self
            .dir
            .join(id)
            .with_extension(CHECKPOINT_EXTENSION))
    }
}

impl RecoveryLog for FileRecoveryLog {
    fn persist(&self, handshake: &Handshake) -> Result<(), RecoveryError> {
        let path = self.checkpoint_path(&handshake.exchange.id)?;
        if path.exists() {
            return Err(RecoveryError::AlreadyPersisted(handshake.exchange.id.clone()));
        }
        fs::create_dir_all(&self.dir)?;

        // Write to tmp then rename, so a crash never leaves a partial checkpoint.
        let tmp_path = path.with_extension("cbor.tmp");
        let bytes = serde_cbor::to_vec(handshake)?;
        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &path)?;
        // The rename itself is durable only once the directory is synced.
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;

        log::debug!(
            "[{}] Recovery checkpoint written to {}",
            handshake.exchange.id,
            path.display()
        );
        Ok(())
    }

    fn load(&self, exchange_id: &ExchangeId) -> Result<Option<Handshake>, RecoveryError> {
        let path = self.checkpoint_path(exchange_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_cbor::from_slice(&bytes)?))
    }

    fn list(&self) -> Result<Vec<ExchangeId>, RecoveryError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(ExchangeId::new(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Checkpoints kept in memory, for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryRecoveryLog {
    checkpoints: Mutex<BTreeMap<ExchangeId, Handshake>>,
}

impl RecoveryLog for MemoryRecoveryLog {
    fn persist(&self, handshake: &Handshake) -> Result<(), RecoveryError> {
        let mut checkpoints = self.checkpoints.lock()?;
        if checkpoints.contains_key(&handshake.exchange.id) {
            return Err(RecoveryError::AlreadyPersisted(handshake.exchange.id.clone()));
        }
        checkpoints.insert(handshake.exchange.id.clone(), handshake.clone());
        Ok(())
    }

    fn load(&self, exchange_id: &ExchangeId) -> Result<Option<Handshake>, RecoveryError> {
        Ok(self.checkpoints.lock()?.get(exchange_id).cloned())
    }

    fn list(&self) -> Result<Vec<ExchangeId>, RecoveryError> {
        Ok(self.checkpoints.lock()?.keys().cloned().collect())
    }
}
