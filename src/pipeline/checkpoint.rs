// src/pipeline/checkpoint.rs
//! Versioned RunState snapshots: `{checkpoint_dir}/{run_id}.json`.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::state::RunState;
use super::is_valid_run_id;
use crate::error::PipelineError;

/// Bump when the serialized RunState layout changes incompatibly.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    pub run_id: String,
    pub saved_at: DateTime<Utc>,
    pub state: RunState,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// Atomic write (temp file + rename).
    pub async fn save(&self, state: &RunState) -> anyhow::Result<PathBuf> {
        if !is_valid_run_id(state.run_id()) {
            anyhow::bail!("invalid run id '{}'", state.run_id());
        }
        let snap = Snapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            run_id: state.run_id().to_string(),
            saved_at: Utc::now(),
            state: state.clone(),
        };
        let bytes = serde_json::to_vec(&snap).context("serializing snapshot")?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(state.run_id());
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context("renaming snapshot into place")?;
        Ok(path)
    }

    /// Load and validate. The schema version is checked before the state
    /// itself is decoded.
    pub async fn load(&self, run_id: &str) -> Result<RunState, PipelineError> {
        let bad = |msg: String| PipelineError::SnapshotIncompatible(msg);
        if !is_valid_run_id(run_id) {
            return Err(bad(format!("invalid run id '{run_id}'")));
        }
        let path = self.path_for(run_id);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| bad(format!("cannot read {}: {e}", path.display())))?;
        let raw: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| bad(format!("not json: {e}")))?;

        let version = raw
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| bad("missing schema_version".to_string()))?;
        if version != u64::from(SNAPSHOT_SCHEMA_VERSION) {
            return Err(bad(format!(
                "schema_version {version}, expected {SNAPSHOT_SCHEMA_VERSION}"
            )));
        }

        let snap: Snapshot =
            serde_json::from_value(raw).map_err(|e| bad(format!("malformed snapshot: {e}")))?;
        if snap.run_id != run_id || snap.state.run_id() != run_id {
            return Err(bad(format!(
                "snapshot belongs to run '{}', requested '{run_id}'",
                snap.run_id
            )));
        }
        Ok(snap.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = RunState::new("run-a".into(), RunConfig::default());
        store.save(&state).await.unwrap();
        assert_eq!(store.load("run-a").await.unwrap(), state);
    }

    #[tokio::test]
    async fn version_and_identity_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        std::fs::write(
            store.path_for("run-v"),
            r#"{"schema_version": 99, "run_id": "run-v", "state": {}}"#,
        )
        .unwrap();
        let err = store.load("run-v").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SnapshotIncompatible);
        assert!(err.to_string().contains("99"));

        let state = RunState::new("run-b".into(), RunConfig::default());
        store.save(&state).await.unwrap();
        std::fs::copy(store.path_for("run-b"), store.path_for("run-c")).unwrap();
        assert!(store.load("run-c").await.is_err());

        assert!(store.load("missing").await.is_err());
        assert!(store.load("../x").await.is_err());
    }
}
