//! Channel state
//!
//! Every logical channel has one [`PlaybackState`] shared by all bindings that
//! name its key. The [`StateStore`] keeps them in one map and writes the whole
//! map through to its persistence backend while the write lock is held, so an
//! update is durable and visible to every reader before it returns.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sonora_core::{AssetId, ChannelKey, NOT_PLAYING, TickRate};
use sonora_platform::FileSystem;

use crate::{StateError, StateResult};

/// Snapshot of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub asset_id: Option<AssetId>,
    #[serde(rename = "displayName")]
    pub asset_display_name: String,
    pub playing: bool,
    pub looping: bool,
    pub start_tick: i64,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            asset_id: None,
            asset_display_name: String::new(),
            playing: false,
            looping: false,
            start_tick: NOT_PLAYING,
        }
    }
}

impl PlaybackState {
    /// Whether `playing` and `start_tick` agree
    pub fn is_consistent(&self) -> bool {
        if self.playing {
            self.start_tick >= 0
        } else {
            self.start_tick == NOT_PLAYING
        }
    }

    /// Check the `playing`/`start_tick` invariant
    pub fn validate(&self, key: &ChannelKey) -> StateResult<()> {
        if self.is_consistent() {
            return Ok(());
        }
        Err(StateError::Inconsistent {
            key: key.to_string(),
            playing: self.playing,
            start_tick: self.start_tick,
        })
    }

    /// Mark the channel playing, keeping an existing start tick
    pub fn start(&mut self, now: i64) {
        self.playing = true;
        if self.start_tick == NOT_PLAYING {
            self.start_tick = now.max(0);
        }
    }

    /// Mark the channel stopped
    pub fn stop(&mut self) {
        self.playing = false;
        self.start_tick = NOT_PLAYING;
    }

    /// Bind an asset, stopping whatever played before
    pub fn assign(&mut self, asset_id: AssetId, display_name: impl Into<String>) {
        self.asset_id = Some(asset_id);
        self.asset_display_name = display_name.into();
        self.stop();
    }

    /// Seconds since the channel started, zero when not playing
    pub fn elapsed_seconds(&self, rate: TickRate, now: i64) -> f64 {
        if !self.playing {
            return 0.0;
        }
        rate.elapsed_seconds(self.start_tick, now)
    }
}

/// Durable backing of the state map
pub trait StatePersistence: Send + Sync {
    /// Load every persisted channel
    fn load(&self) -> StateResult<BTreeMap<ChannelKey, PlaybackState>>;

    /// Replace the persisted map
    fn save(&self, states: &BTreeMap<ChannelKey, PlaybackState>) -> StateResult<()>;
}

/// Channel map stored as one JSON document, replaced atomically
pub struct JsonFilePersistence {
    fs: FileSystem,
    file_name: String,
}

impl JsonFilePersistence {
    /// Persist to `path`, creating its directory if needed
    pub fn new(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::path::PathBuf::from("."),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StateError::InvalidPath(path.display().to_string()))?;
        Ok(Self {
            fs: FileSystem::open(dir)?,
            file_name,
        })
    }
}

impl StatePersistence for JsonFilePersistence {
    fn load(&self) -> StateResult<BTreeMap<ChannelKey, PlaybackState>> {
        if !self.fs.exists(&self.file_name) {
            return Ok(BTreeMap::new());
        }
        let text = self.fs.read_string(&self.file_name)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save(&self, states: &BTreeMap<ChannelKey, PlaybackState>) -> StateResult<()> {
        let json = serde_json::to_vec_pretty(states)?;
        self.fs.write_atomic(&self.file_name, &json)?;
        Ok(())
    }
}

/// In-memory persistence, for tests and ephemeral servers
#[derive(Default)]
pub struct MemoryPersistence {
    saved: Mutex<BTreeMap<ChannelKey, PlaybackState>>,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following save fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Last saved map
    pub fn saved(&self) -> BTreeMap<ChannelKey, PlaybackState> {
        self.saved.lock().clone()
    }
}

impl StatePersistence for MemoryPersistence {
    fn load(&self) -> StateResult<BTreeMap<ChannelKey, PlaybackState>> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, states: &BTreeMap<ChannelKey, PlaybackState>) -> StateResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StateError::Persistence(String::from("simulated write failure")));
        }
        *self.saved.lock() = states.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<P: StatePersistence + ?Sized> StatePersistence for std::sync::Arc<P> {
    fn load(&self) -> StateResult<BTreeMap<ChannelKey, PlaybackState>> {
        (**self).load()
    }

    fn save(&self, states: &BTreeMap<ChannelKey, PlaybackState>) -> StateResult<()> {
        (**self).save(states)
    }
}

struct ChannelEntry {
    state: PlaybackState,
    refs: usize,
}

/// Authoritative map from channel key to state
pub struct StateStore {
    entries: RwLock<AHashMap<ChannelKey, ChannelEntry>>,
    persistence: Box<dyn StatePersistence>,
}

impl StateStore {
    /// Create a store over `persistence`, loading whatever it holds
    pub fn new(persistence: impl StatePersistence + 'static) -> StateResult<Self> {
        let mut entries = AHashMap::new();
        for (key, state) in persistence.load()? {
            if !state.is_consistent() {
                log::warn!("Dropping inconsistent persisted state for channel '{}'", key);
                continue;
            }
            entries.insert(key, ChannelEntry { state, refs: 0 });
        }
        log::info!("Loaded {} channel states", entries.len());

        Ok(Self {
            entries: RwLock::new(entries),
            persistence: Box::new(persistence),
        })
    }

    /// Open a store persisted as JSON at `path`
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        Self::new(JsonFilePersistence::new(path)?)
    }

    /// Non-durable store
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(AHashMap::new()),
            persistence: Box::new(MemoryPersistence::new()),
        }
    }

    /// State of `key`, created with defaults when absent.
    ///
    /// A freshly created default is not written through; it is
    /// indistinguishable from an absent key on reload.
    pub fn get_or_create(&self, key: &ChannelKey) -> PlaybackState {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.state.clone();
        }
        let mut entries = self.entries.write();
        entries
            .entry(key.clone())
            .or_insert_with(|| ChannelEntry {
                state: PlaybackState::default(),
                refs: 0,
            })
            .state
            .clone()
    }

    /// State of `key`, if it exists
    pub fn get(&self, key: &ChannelKey) -> Option<PlaybackState> {
        self.entries.read().get(key).map(|entry| entry.state.clone())
    }

    /// Replace the state of `key` and persist
    pub fn update(&self, key: &ChannelKey, state: PlaybackState) -> StateResult<()> {
        state.validate(key)?;

        let mut entries = self.entries.write();
        let previous = match entries.get_mut(key) {
            Some(entry) => Some(std::mem::replace(&mut entry.state, state)),
            None => {
                entries.insert(key.clone(), ChannelEntry { state, refs: 0 });
                None
            }
        };

        if let Err(err) = self.persist(&entries) {
            match previous {
                Some(previous) => {
                    if let Some(entry) = entries.get_mut(key) {
                        entry.state = previous;
                    }
                }
                None => {
                    entries.remove(key);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remove `key` and persist; returns its last state
    pub fn remove(&self, key: &ChannelKey) -> StateResult<Option<PlaybackState>> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.remove(key) else {
            return Ok(None);
        };
        if let Err(err) = self.persist(&entries) {
            entries.insert(key.clone(), entry);
            return Err(err);
        }
        Ok(Some(entry.state))
    }

    /// Register a binding on `key`, creating the channel if needed
    pub fn acquire(&self, key: &ChannelKey) -> PlaybackState {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_insert_with(|| ChannelEntry {
            state: PlaybackState::default(),
            refs: 0,
        });
        entry.refs += 1;
        entry.state.clone()
    }

    /// Drop a binding on `key`; the channel goes away with its last binding.
    ///
    /// Returns whether the channel was removed.
    pub fn release(&self, key: &ChannelKey) -> StateResult<bool> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return Ok(false);
        }

        let Some(entry) = entries.remove(key) else {
            return Ok(false);
        };
        if let Err(err) = self.persist(&entries) {
            entries.insert(key.clone(), entry);
            return Err(err);
        }
        log::debug!("Channel '{}' released by its last binding", key);
        Ok(true)
    }

    /// Number of bindings referencing `key`
    pub fn ref_count(&self, key: &ChannelKey) -> usize {
        self.entries.read().get(key).map_or(0, |entry| entry.refs)
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether there are no channels
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn persist(&self, entries: &AHashMap<ChannelKey, ChannelEntry>) -> StateResult<()> {
        let snapshot: BTreeMap<ChannelKey, PlaybackState> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.state.clone()))
            .collect();
        self.persistence.save(&snapshot)
    }
}
