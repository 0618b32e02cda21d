// =============================================================================
// Persistence — atomic JSON state files, one per market
// =============================================================================
//
// File layout: `<data_dir>/grid_data_spot.json` / `grid_data_futures.json`.
// Saves write a sibling tmp file, fsync it, and rename over the target so a
// crash can never leave a torn file. A file that fails schema validation is
// refused outright; there is no partial load.
//
// The save task coalesces bursts of save requests and also runs a periodic
// auto-save, so a stream of fills does not turn into a stream of writes.
// =============================================================================

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::grid::data::GridData;
use crate::grid::manager::StrategyManager;
use crate::types::InstType;

/// Wire form of one market's strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub inst_type: InstType,
    pub strategies: BTreeMap<String, GridData>,
    pub running_strategies: Vec<String>,
    pub last_save: DateTime<Utc>,
}

impl PersistedState {
    /// Snapshot a manager into its persistable form.
    pub fn capture(manager: &StrategyManager) -> Self {
        let mut running = manager.running_uids();
        running.sort();
        Self {
            inst_type: manager.inst_type(),
            strategies: manager.export_strategies().into_iter().collect(),
            running_strategies: running,
            last_save: Utc::now(),
        }
    }

    /// Sanity checks beyond what serde enforces structurally.
    fn validate(&self) -> EngineResult<()> {
        for (key, data) in &self.strategies {
            if key != &data.uid {
                return Err(EngineError::Persistence(format!(
                    "strategy key {key} does not match embedded uid {}",
                    data.uid
                )));
            }
            if data.inst_type != self.inst_type {
                return Err(EngineError::Persistence(format!(
                    "strategy {key} has inst_type {} in a {} file",
                    data.inst_type, self.inst_type
                )));
            }
            // Level indices must be dense from 0 with no fill holes.
            let mut expected = 0u32;
            let mut below_unfilled = false;
            for (level, config) in &data.grid_levels {
                if *level != expected {
                    return Err(EngineError::Persistence(format!(
                        "strategy {key} has non-dense level index {level}"
                    )));
                }
                if config.is_filled && below_unfilled {
                    return Err(EngineError::Persistence(format!(
                        "strategy {key} has a fill hole below level {level}"
                    )));
                }
                below_unfilled |= !config.is_filled;
                expected += 1;
            }
        }
        for uid in &self.running_strategies {
            if !self.strategies.contains_key(uid) {
                return Err(EngineError::Persistence(format!(
                    "running strategy {uid} is not present in the file"
                )));
            }
        }
        Ok(())
    }
}

/// JSON-file store for grid state.
#[derive(Debug, Clone)]
pub struct JsonStore {
    data_dir: PathBuf,
}

impl JsonStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn file_path(&self, inst_type: InstType) -> PathBuf {
        self.data_dir
            .join(format!("grid_data_{}.json", inst_type.file_tag()))
    }

    /// Atomically persist one market's state: tmp file, fsync, rename.
    pub fn save(&self, state: &PersistedState) -> EngineResult<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| EngineError::Persistence(format!("create {:?}: {e}", self.data_dir)))?;

        let path = self.file_path(state.inst_type);
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| EngineError::Persistence(format!("serialize state: {e}")))?;

        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| EngineError::Persistence(format!("create {tmp_path:?}: {e}")))?;
        file.write_all(&content)
            .map_err(|e| EngineError::Persistence(format!("write {tmp_path:?}: {e}")))?;
        file.sync_all()
            .map_err(|e| EngineError::Persistence(format!("fsync {tmp_path:?}: {e}")))?;
        drop(file);

        std::fs::rename(&tmp_path, &path)
            .map_err(|e| EngineError::Persistence(format!("rename to {path:?}: {e}")))?;

        debug!(path = %path.display(), strategies = state.strategies.len(), "state saved");
        Ok(())
    }

    /// Load one market's state. `Ok(None)` when no file exists yet; an
    /// invalid file is an error, never a partial result.
    pub fn load(&self, inst_type: InstType) -> EngineResult<Option<PersistedState>> {
        let path = self.file_path(inst_type);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Persistence(format!("read {path:?}: {e}")))?;
        let state: PersistedState = serde_json::from_str(&content)
            .map_err(|e| EngineError::Persistence(format!("parse {path:?}: {e}")))?;
        state.validate()?;

        info!(
            path = %path.display(),
            strategies = state.strategies.len(),
            running = state.running_strategies.len(),
            "state loaded"
        );
        Ok(Some(state))
    }
}

/// Restore a manager from a loaded state. Returns the uids that were running
/// at save time so the caller can restart them.
pub fn restore_manager(manager: &StrategyManager, state: PersistedState) -> Vec<String> {
    let count = state.strategies.len();
    for (_, data) in state.strategies {
        manager.restore_strategy(data);
    }
    manager.events().publish(EngineEvent::StrategiesLoaded(format!(
        "{count} strategies loaded"
    )));
    state.running_strategies
}

/// Persistence task: drains save requests from the event bus, coalescing
/// bursts, and auto-saves on the configured interval. Failed saves are
/// retried on the next trigger.
pub async fn run_save_task(
    manager: Arc<StrategyManager>,
    store: JsonStore,
    auto_save_interval_ms: u64,
) {
    let mut events = manager.events().subscribe();
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(auto_save_interval_ms.max(1000)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick fires immediately; swallow it.
    interval.tick().await;

    info!(inst_type = %manager.inst_type(), "persistence task started");
    loop {
        let triggered = tokio::select! {
            _ = interval.tick() => true,
            event = events.recv() => match event {
                Ok(EngineEvent::SaveRequested(_)) => true,
                Ok(_) => false,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Lost events are fine; a save covers everything anyway.
                    debug!(skipped, "save task lagged behind the event bus");
                    true
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if !triggered {
            continue;
        }

        // Coalesce the burst: drain whatever queued while we were busy.
        loop {
            match events.try_recv() {
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Closed) => break,
            }
        }

        let state = PersistedState::capture(manager.as_ref());
        let count = state.strategies.len();
        match store.save(&state) {
            Ok(()) => manager.events().publish(EngineEvent::StrategiesSaved(format!(
                "{count} strategies saved"
            ))),
            Err(e) => warn!(error = %e, "save failed; will retry on next trigger"),
        }
    }
    info!("persistence task exited");
}

/// Synchronous final save used on shutdown.
pub fn save_now(manager: &StrategyManager, store: &JsonStore) -> EngineResult<()> {
    let state = PersistedState::capture(manager);
    store.save(&state)?;
    manager.events().publish(EngineEvent::StrategiesSaved(format!(
        "{} strategies saved",
        state.strategies.len()
    )));
    Ok(())
}

/// Ensure the store's directory exists and is writable.
pub fn ensure_data_dir(path: &Path) -> EngineResult<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| EngineError::Persistence(format!("create {path:?}: {e}")))
}
