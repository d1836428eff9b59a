//! ---
//! tb_section: "05-checkpoint-persistence"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "Checkpoint store trait and the JSON file backend."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---

//! Where checkpoints live between harness invocations.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::run_state::RunState;
use crate::{Result, StateStoreError};

/// Envelope version written by this build. Bumped whenever the
/// persisted layout changes incompatibly.
pub const STATE_VERSION: u16 = 1;

/// Abstract checkpoint storage keyed by run id.
///
/// Implementations must make `save` atomic: a crash mid-save leaves
/// either the previous checkpoint or the new one, never a torn file.
pub trait StateStore: Send + Sync {
    /// Load the checkpoint for a run, `None` when none was ever saved.
    fn load(&self, run_id: &str) -> Result<Option<RunState>>;

    /// Persist a checkpoint, replacing any previous one for this run.
    fn save(&self, run_id: &str, state: &RunState) -> Result<()>;

    /// Remove the checkpoint for a run. Clearing an absent checkpoint
    /// is not an error.
    fn clear(&self, run_id: &str) -> Result<()>;
}

/// On-disk wrapper around a [`RunState`].
#[derive(Debug, Serialize, Deserialize)]
struct StateEnvelope {
    version: u16,
    saved_at: DateTime<Utc>,
    hash: String,
    state: RunState,
}

/// File-backed [`StateStore`] keeping one JSON envelope per run id.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    root: PathBuf,
}

impl JsonStateStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory this store keeps its envelopes in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the checkpoint for `run_id`.
    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("{run_id}.json"))
    }
}

impl StateStore for JsonStateStore {
    fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        let path = self.path_for(run_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let envelope: StateEnvelope =
            serde_json::from_slice(&bytes).map_err(|err| StateStoreError::Corrupt {
                path: path.clone(),
                detail: err.to_string(),
            })?;

        if envelope.version != STATE_VERSION {
            return Err(StateStoreError::Version {
                path,
                found: envelope.version,
                expected: STATE_VERSION,
            });
        }

        let expected = compute_hash(&envelope.state)?;
        if envelope.hash != expected {
            return Err(StateStoreError::Corrupt {
                path,
                detail: "integrity hash does not match payload".to_string(),
            });
        }

        if envelope.state.run_id != run_id {
            return Err(StateStoreError::Corrupt {
                path,
                detail: format!(
                    "envelope belongs to run '{}', not '{run_id}'",
                    envelope.state.run_id
                ),
            });
        }

        debug!(run_id, path = %path.display(), "loaded run state");
        Ok(Some(envelope.state))
    }

    fn save(&self, run_id: &str, state: &RunState) -> Result<()> {
        let path = self.path_for(run_id);
        let envelope = StateEnvelope {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            hash: compute_hash(state)?,
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        // Write next to the target so the rename stays on one
        // filesystem, then swap it in.
        let mut staged = NamedTempFile::new_in(&self.root)?;
        staged.write_all(&bytes)?;
        staged
            .persist(&path)
            .map_err(|err| StateStoreError::Io(err.error))?;

        debug!(run_id, path = %path.display(), stages = state.stages.len(), "saved run state");
        Ok(())
    }

    fn clear(&self, run_id: &str) -> Result<()> {
        let path = self.path_for(run_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(run_id, path = %path.display(), "cleared run state");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Hex SHA-256 over the canonical JSON bytes of the state payload.
fn compute_hash(state: &RunState) -> Result<String> {
    let bytes = serde_json::to_vec(state)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}
