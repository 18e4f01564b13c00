// src/store_manager.rs
//
// Key-value settings store shared by the daemon and the CLI.
// Data is cached in memory and persisted to a single JSON object file with
// debounced atomic writes. External edits (another process writing the file)
// are picked up by `reload_if_changed`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;

/// Debounce window for writes triggered by `set`
const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {path} is not a JSON object: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store lock poisoned")]
    Lock,
}

/// Read/write contract of the settings store
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Fetch the given keys. Missing keys are absent from the result.
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, StoreError>;

    /// Merge the given entries into the store. `null` values remove the key.
    async fn set(&self, partial: Map<String, Value>) -> Result<(), StoreError>;
}

/// The store data structure - a simple key-value store
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(flatten)]
    entries: HashMap<String, Value>,
}

#[derive(Debug)]
struct StoreState {
    data: StoreData,
    /// Path to the store file (None for in-memory stores)
    store_path: Option<PathBuf>,
    /// Keys changed locally since the last save, with the edit number of
    /// their latest change
    dirty: HashMap<String, u64>,
    edit_seq: u64,
    /// External edits were merged by a save and not yet reported by
    /// `reload_if_changed`
    merged_external: bool,
    /// Modification time of the file as last read or written by us
    seen_mtime: Option<SystemTime>,
    /// Last save time
    last_save: Instant,
}

/// File-backed settings store
pub struct StoreManager {
    state: RwLock<StoreState>,
    save_tx: Option<mpsc::UnboundedSender<()>>,
}

// ============================================================================
// Internal Functions
// ============================================================================

/// Load store data from disk
fn load_from_disk(path: &Path) -> Result<StoreData, StoreError> {
    if !path.exists() {
        return Ok(StoreData::default());
    }

    let content = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if content.trim().is_empty() {
        return Ok(StoreData::default());
    }

    serde_json::from_str(&content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Take the file's contents, except for keys with unsaved local edits.
fn merge_external(state: &mut StoreState, mut external: StoreData) {
    for key in state.dirty.keys() {
        match state.data.entries.get(key) {
            Some(value) => {
                external.entries.insert(key.clone(), value.clone());
            }
            None => {
                external.entries.remove(key);
            }
        }
    }
    state.data = external;
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Spawn the debounced save loop on its own thread so the store works with or
/// without an ambient runtime.
fn spawn_save_loop(store: Weak<StoreManager>) -> Result<mpsc::UnboundedSender<()>, StoreError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|source| StoreError::Io {
            path: PathBuf::from("<save-thread>"),
            source,
        })?;

    std::thread::spawn(move || {
        rt.block_on(async {
            let mut pending = false;

            loop {
                tokio::select! {
                    result = rx.recv() => {
                        if result.is_none() {
                            // Channel closed
                            break;
                        }
                        pending = true;
                    }
                    _ = tokio::time::sleep(SAVE_DEBOUNCE), if pending => {
                        pending = false;
                        let Some(store) = store.upgrade() else { break };
                        if let Err(e) = store.flush() {
                            tlog!("[StoreManager] Failed to save: {}", e);
                        }
                    }
                }
            }
        });
    });

    Ok(tx)
}

// ============================================================================
// Public API
// ============================================================================

impl StoreManager {
    /// Open (or create on first save) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let path = path.into();
        let data = load_from_disk(&path)?;

        tlog!(
            "[StoreManager] Opened {} with {} entries",
            path.display(),
            data.entries.len()
        );

        let state = StoreState {
            data,
            seen_mtime: file_mtime(&path),
            store_path: Some(path),
            dirty: HashMap::new(),
            edit_seq: 0,
            merged_external: false,
            last_save: Instant::now(),
        };

        Ok(Arc::new_cyclic(|weak| {
            let save_tx = match spawn_save_loop(weak.clone()) {
                Ok(tx) => Some(tx),
                Err(e) => {
                    tlog!("[StoreManager] Debounced saving disabled: {}", e);
                    None
                }
            };
            Self {
                state: RwLock::new(state),
                save_tx,
            }
        }))
    }

    /// Store that never touches the filesystem
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(StoreState {
                data: StoreData::default(),
                store_path: None,
                dirty: HashMap::new(),
                edit_seq: 0,
                merged_external: false,
                seen_mtime: None,
                last_save: Instant::now(),
            }),
            save_tx: None,
        })
    }

    /// Get a value from the store
    pub fn get_value(&self, key: &str) -> Option<Value> {
        let state = self.state.read().ok()?;
        state.data.entries.get(key).cloned()
    }

    /// Merge entries; `null` deletes. Schedules a debounced save.
    pub fn apply(&self, partial: Map<String, Value>) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::Lock)?;
        state.edit_seq += 1;
        let seq = state.edit_seq;
        for (key, value) in partial {
            if value.is_null() {
                state.data.entries.remove(&key);
            } else {
                state.data.entries.insert(key.clone(), value);
            }
            state.dirty.insert(key, seq);
        }
        drop(state); // Release lock before scheduling save

        self.schedule_save();
        Ok(())
    }

    /// All entries, for display
    pub fn snapshot(&self) -> Map<String, Value> {
        self.state
            .read()
            .map(|s| {
                s.data
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Force an immediate save (atomic write: temp file, then rename).
    /// Edits another process made since we last looked are merged in first;
    /// only our own unsaved keys override them.
    pub fn flush(&self) -> Result<(), StoreError> {
        let (path, json, written) = {
            let mut state = self.state.write().map_err(|_| StoreError::Lock)?;

            let path = match &state.store_path {
                Some(p) => p.clone(),
                None => return Ok(()),
            };

            if state.dirty.is_empty() {
                return Ok(());
            }

            let current = file_mtime(&path);
            if current.is_some() && current != state.seen_mtime {
                let external = load_from_disk(&path)?;
                merge_external(&mut state, external);
                state.seen_mtime = current;
                state.merged_external = true;
                tlog!("[StoreManager] Merged external edits to {} before saving", path.display());
            }

            let json = serde_json::to_string_pretty(&state.data).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?;
            (path, json, state.dirty.clone())
        }; // Lock released before file operations

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &json).map_err(|source| StoreError::Io {
            path: temp_path.clone(),
            source,
        })?;
        fs::rename(&temp_path, &path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        let mut state = self.state.write().map_err(|_| StoreError::Lock)?;
        // Keys edited again while we were writing stay dirty
        state.dirty.retain(|key, seq| written.get(key) != Some(&*seq));
        state.last_save = Instant::now();
        state.seen_mtime = file_mtime(&path);

        Ok(())
    }

    /// Re-read the file if another process modified it since we last saw it.
    /// Returns true when the in-memory data changed.
    pub fn reload_if_changed(&self) -> Result<bool, StoreError> {
        let (path, seen) = {
            let mut state = self.state.write().map_err(|_| StoreError::Lock)?;
            let merged = std::mem::take(&mut state.merged_external);
            match &state.store_path {
                Some(p) => (p.clone(), if merged { None } else { state.seen_mtime }),
                None => return Ok(false),
            }
        };

        let current = file_mtime(&path);
        if current.is_none() || current == seen {
            return Ok(false);
        }

        let external = load_from_disk(&path)?;
        let mut state = self.state.write().map_err(|_| StoreError::Lock)?;
        merge_external(&mut state, external);
        state.seen_mtime = current;
        tlog!(
            "[StoreManager] Reloaded {} ({} entries, last save {:?} ago)",
            path.display(),
            state.data.entries.len(),
            state.last_save.elapsed()
        );
        Ok(true)
    }

    /// Schedule a debounced save
    fn schedule_save(&self) {
        if let Some(tx) = &self.save_tx {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl SettingsStore for StoreManager {
    async fn get(&self, keys: &[&str]) -> Result<Map<String, Value>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::Lock)?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                state
                    .data
                    .entries
                    .get(*key)
                    .map(|value| (key.to_string(), value.clone()))
            })
            .collect())
    }

    async fn set(&self, partial: Map<String, Value>) -> Result<(), StoreError> {
        self.apply(partial)
    }
}
