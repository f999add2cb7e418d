//! Playback scheduling
//!
//! Runs once per simulation tick. Each bound position is either idle or
//! active (powered and its channel playing). Activation edges start and stop
//! the channel; while active, observers entering range are told to join at the
//! channel's elapsed offset and observers leaving range are told to stop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use smallvec::SmallVec;
use sonora_core::{AssetId, BlockPos, ChannelKey, ObserverId, ServerConfig, TickRate};
use sonora_platform::ScopedTimer;
use sonora_transfer::{Directive, Outbox};

use crate::state::{PlaybackState, StateStore};
use crate::world::{Activation, Observer, World};
use crate::{SchedulerError, SchedulerResult};

/// How a position is bound to its channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKind {
    /// Plain speaker with private inline state
    Standalone,
    /// Proxy sharing the state of a keyed channel
    Proxy(ChannelKey),
}

enum Channel {
    Inline(PlaybackState),
    Shared(ChannelKey),
}

struct Binding {
    channel: Channel,
    observers: BTreeSet<ObserverId>,
    last_powered: Option<bool>,
}

struct TickContext<'a> {
    states: &'a StateStore,
    rate: TickRate,
    range: f32,
    now: i64,
    observers: &'a [Observer],
}

impl Binding {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            observers: BTreeSet::new(),
            last_powered: None,
        }
    }

    fn key(&self) -> Option<&ChannelKey> {
        match &self.channel {
            Channel::Inline(_) => None,
            Channel::Shared(key) => Some(key),
        }
    }

    fn kind(&self) -> BindingKind {
        match &self.channel {
            Channel::Inline(_) => BindingKind::Standalone,
            Channel::Shared(key) => BindingKind::Proxy(key.clone()),
        }
    }

    fn state(&self, states: &StateStore) -> PlaybackState {
        match &self.channel {
            Channel::Inline(state) => state.clone(),
            Channel::Shared(key) => states.get_or_create(key),
        }
    }

    fn set_state(&mut self, pos: BlockPos, states: &StateStore, state: PlaybackState) -> SchedulerResult<()> {
        match &mut self.channel {
            Channel::Inline(current) => {
                state.validate(&ChannelKey::for_position(pos))?;
                *current = state;
            }
            Channel::Shared(key) => states.update(key, state)?,
        }
        Ok(())
    }

    /// Whether no other binding shares this channel
    fn is_sole_binding(&self, states: &StateStore) -> bool {
        match &self.channel {
            Channel::Inline(_) => true,
            Channel::Shared(key) => states.ref_count(key) <= 1,
        }
    }

    fn stop_observers(&mut self, pos: BlockPos, out: &mut impl Outbox<(ObserverId, Directive)>) {
        for id in std::mem::take(&mut self.observers) {
            out.push((id, Directive::Stop { position: pos }));
        }
    }

    /// Run one tick for this binding.
    ///
    /// The observed power level is only committed once the resulting
    /// transition has been written, so a failed write is retried next tick.
    fn tick(
        &mut self,
        pos: BlockPos,
        powered: bool,
        cx: &TickContext<'_>,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) -> SchedulerResult<()> {
        let previous = self.last_powered;
        self.step(pos, previous, powered, cx, out)?;
        self.last_powered = Some(powered);
        Ok(())
    }

    fn step(
        &mut self,
        pos: BlockPos,
        previous: Option<bool>,
        powered: bool,
        cx: &TickContext<'_>,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) -> SchedulerResult<()> {
        let mut state = self.state(cx.states);

        match previous {
            Some(false) if powered => {
                if state.asset_id.is_none() {
                    log::debug!("Speaker at {} powered without an asset", pos);
                } else if !state.playing {
                    state.start(cx.now);
                    self.set_state(pos, cx.states, state.clone())?;
                    log::info!("Channel at {} started at tick {}", pos, cx.now);
                }
                self.observers.clear();
            }
            Some(true) if !powered && state.playing => {
                return self.power_lost(pos, state, cx, out);
            }
            // First sight after load: unpowered but still marked playing
            None if !powered && state.playing && self.is_sole_binding(cx.states) => {
                return self.power_lost(pos, state, cx, out);
            }
            _ => {}
        }

        if !(powered && state.playing) {
            if !self.observers.is_empty() {
                log::debug!("Channel at {} is no longer playing", pos);
                self.stop_observers(pos, out);
            }
            return Ok(());
        }

        self.sync_observers(pos, &state, cx, out);
        Ok(())
    }

    fn power_lost(
        &mut self,
        pos: BlockPos,
        mut state: PlaybackState,
        cx: &TickContext<'_>,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) -> SchedulerResult<()> {
        self.stop_observers(pos, out);
        state.stop();
        self.set_state(pos, cx.states, state)?;
        log::info!("Channel at {} stopped at tick {}", pos, cx.now);
        Ok(())
    }

    fn sync_observers(
        &mut self,
        pos: BlockPos,
        state: &PlaybackState,
        cx: &TickContext<'_>,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) {
        let Some(asset_id) = state.asset_id else {
            return;
        };
        let offset_seconds = state.elapsed_seconds(cx.rate, cx.now);

        let mut in_range: SmallVec<[ObserverId; 16]> = SmallVec::new();
        for observer in cx.observers {
            if !pos.is_within(observer.position, cx.range) {
                continue;
            }
            in_range.push(observer.id);
            if self.observers.insert(observer.id) {
                log::debug!("Observer {} joins {} at {:.2}s", observer.id, pos, offset_seconds);
                out.push((
                    observer.id,
                    Directive::Play {
                        position: pos,
                        asset_id,
                        display_name: state.asset_display_name.clone(),
                        offset_seconds,
                        looping: state.looping,
                    },
                ));
            }
        }

        self.observers.retain(|id| {
            let keep = in_range.contains(id);
            if !keep {
                out.push((*id, Directive::Stop { position: pos }));
            }
            keep
        });
    }
}

/// Per-tick driver of every speaker and proxy binding
pub struct PlaybackScheduler {
    states: Arc<StateStore>,
    rate: TickRate,
    range: f32,
    bindings: BTreeMap<BlockPos, Binding>,
}

impl PlaybackScheduler {
    /// Create a scheduler using the server's tick rate and listen range
    pub fn new(states: Arc<StateStore>, config: &ServerConfig) -> Self {
        Self::with_settings(states, config.tick_rate(), config.listen_range)
    }

    /// Create a scheduler with explicit settings
    pub fn with_settings(states: Arc<StateStore>, rate: TickRate, range: f32) -> Self {
        Self {
            states,
            rate,
            range,
            bindings: BTreeMap::new(),
        }
    }

    /// Shared channel store
    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    pub fn rate(&self) -> TickRate {
        self.rate
    }

    pub fn range(&self) -> f32 {
        self.range
    }

    /// Number of bindings
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Whether `pos` is bound
    pub fn is_bound(&self, pos: BlockPos) -> bool {
        self.bindings.contains_key(&pos)
    }

    /// Bind a standalone speaker with fresh state
    pub fn bind_speaker(&mut self, pos: BlockPos) -> SchedulerResult<()> {
        self.restore_speaker(pos, PlaybackState::default())
    }

    /// Bind a standalone speaker with state saved by the host
    pub fn restore_speaker(&mut self, pos: BlockPos, state: PlaybackState) -> SchedulerResult<()> {
        if self.bindings.contains_key(&pos) {
            return Err(SchedulerError::AlreadyBound(pos));
        }
        state.validate(&ChannelKey::for_position(pos))?;
        self.bindings.insert(pos, Binding::new(Channel::Inline(state)));
        log::debug!("Bound speaker at {}", pos);
        Ok(())
    }

    /// Bind a proxy to the channel `key`
    pub fn bind_proxy(&mut self, pos: BlockPos, key: ChannelKey) -> SchedulerResult<()> {
        if self.bindings.contains_key(&pos) {
            return Err(SchedulerError::AlreadyBound(pos));
        }
        self.states.acquire(&key);
        log::debug!("Bound proxy at {} to channel '{}'", pos, key);
        self.bindings.insert(pos, Binding::new(Channel::Shared(key)));
        Ok(())
    }

    /// Drop a binding, stopping its observers
    pub fn unbind(
        &mut self,
        pos: BlockPos,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) -> SchedulerResult<()> {
        let mut binding = self
            .bindings
            .remove(&pos)
            .ok_or(SchedulerError::UnknownBinding(pos))?;
        binding.stop_observers(pos, out);
        if let Channel::Shared(key) = &binding.channel {
            self.states.release(key)?;
        }
        log::debug!("Unbound {}", pos);
        Ok(())
    }

    /// Kind of binding at `pos`
    pub fn binding_kind(&self, pos: BlockPos) -> Option<BindingKind> {
        self.bindings.get(&pos).map(Binding::kind)
    }

    /// Current state of the channel bound at `pos`
    pub fn binding_state(&self, pos: BlockPos) -> Option<PlaybackState> {
        self.bindings.get(&pos).map(|b| b.state(&self.states))
    }

    /// Observers currently receiving audio from `pos`
    pub fn tracked_observers(&self, pos: BlockPos) -> Vec<ObserverId> {
        self.bindings
            .get(&pos)
            .map(|b| b.observers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Bind an asset to the channel at `pos`, stopping current playback
    pub fn assign_asset(
        &mut self,
        pos: BlockPos,
        asset_id: AssetId,
        display_name: &str,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) -> SchedulerResult<()> {
        let mut state = self.state_at(pos)?;
        state.assign(asset_id, display_name);
        self.write_state(pos, state)?;
        self.for_each_peer(pos, |peer, binding| binding.stop_observers(peer, out));
        log::info!("Assigned '{}' ({}) to {}", display_name, asset_id, pos);
        Ok(())
    }

    /// Stop the channel at `pos` regardless of activation
    pub fn stop(
        &mut self,
        pos: BlockPos,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) -> SchedulerResult<()> {
        let mut state = self.state_at(pos)?;
        state.stop();
        self.write_state(pos, state)?;
        self.for_each_peer(pos, |peer, binding| binding.stop_observers(peer, out));
        log::info!("Stopped channel at {}", pos);
        Ok(())
    }

    /// Change the looping flag of the channel at `pos`
    pub fn set_looping(
        &mut self,
        pos: BlockPos,
        looping: bool,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) -> SchedulerResult<()> {
        let mut state = self.state_at(pos)?;
        if state.looping == looping {
            return Ok(());
        }
        state.looping = looping;
        self.write_state(pos, state)?;
        self.for_each_peer(pos, |peer, binding| {
            for id in &binding.observers {
                out.push((
                    *id,
                    Directive::SetLooping {
                        position: peer,
                        looping,
                    },
                ));
            }
        });
        Ok(())
    }

    /// Point the proxy at `pos` at another channel
    pub fn set_channel(
        &mut self,
        pos: BlockPos,
        key: ChannelKey,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) -> SchedulerResult<()> {
        let binding = self
            .bindings
            .get_mut(&pos)
            .ok_or(SchedulerError::UnknownBinding(pos))?;
        let Channel::Shared(current) = &binding.channel else {
            return Err(SchedulerError::StandaloneBinding(pos));
        };
        if *current == key {
            return Ok(());
        }

        binding.stop_observers(pos, out);
        self.states.acquire(&key);
        let previous = std::mem::replace(&mut binding.channel, Channel::Shared(key));
        log::info!("Proxy at {} retargeted", pos);
        if let Channel::Shared(previous) = previous {
            self.states.release(&previous)?;
        }
        Ok(())
    }

    /// Run one tick
    pub fn tick(
        &mut self,
        now: i64,
        world: &impl World,
        out: &mut impl Outbox<(ObserverId, Directive)>,
    ) {
        let _timer = ScopedTimer::traced("scheduler_tick").with_budget(self.rate.step());
        let observers = world.observers();
        let cx = TickContext {
            states: &self.states,
            rate: self.rate,
            range: self.range,
            now,
            observers: &observers,
        };

        let mut missing: SmallVec<[BlockPos; 4]> = SmallVec::new();
        for (pos, binding) in self.bindings.iter_mut() {
            let powered = match world.activation(*pos) {
                Activation::Missing => {
                    missing.push(*pos);
                    continue;
                }
                activation => activation.is_powered(),
            };
            if let Err(err) = binding.tick(*pos, powered, &cx, out) {
                log::warn!("Binding at {} failed at tick {}: {}", pos, now, err);
            }
        }

        for pos in missing {
            log::info!("Binding at {} no longer holds a speaker", pos);
            if let Err(err) = self.unbind(pos, out) {
                log::warn!("Could not unbind {}: {}", pos, err);
            }
        }
    }

    /// Stop every observer of every binding, used on shutdown
    pub fn stop_all_observers(&mut self, out: &mut impl Outbox<(ObserverId, Directive)>) {
        for (pos, binding) in self.bindings.iter_mut() {
            binding.stop_observers(*pos, out);
        }
    }

    fn state_at(&self, pos: BlockPos) -> SchedulerResult<PlaybackState> {
        self.binding_state(pos)
            .ok_or(SchedulerError::UnknownBinding(pos))
    }

    fn write_state(&mut self, pos: BlockPos, state: PlaybackState) -> SchedulerResult<()> {
        let binding = self
            .bindings
            .get_mut(&pos)
            .ok_or(SchedulerError::UnknownBinding(pos))?;
        binding.set_state(pos, &self.states, state)
    }

    /// Visit `pos` and every binding sharing its channel
    fn for_each_peer(&mut self, pos: BlockPos, mut f: impl FnMut(BlockPos, &mut Binding)) {
        let key = self.bindings.get(&pos).and_then(|b| b.key().cloned());
        for (peer, binding) in self.bindings.iter_mut() {
            let shares = match (&key, binding.key()) {
                (Some(key), Some(other)) => key == other,
                _ => false,
            };
            if *peer == pos || shares {
                f(*peer, binding);
            }
        }
    }
}
