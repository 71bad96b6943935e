//! Sound instance manager: per-entity sounds, layers and one-shots
//!
//! An instance is keyed by `(entity, slot)`; the empty slot is the entity's
//! primary sound, named slots are layers. Each instance owns a gain node,
//! an optional panner and an optional occlusion filter, wired
//! `source -> gain -> [panner] -> [occlusion] -> bus input`. Playback
//! sources are single-use, so every play builds a fresh one.
//!
//! Missing buffers and missing instances are logged and ignored: a sound
//! that cannot play degrades to silence rather than failing the caller.

mod fade;
mod layer;
mod occlusion;
mod oneshot;

pub use layer::LayerOptions;
pub use oneshot::OneShotOptions;

use crate::buffer::{AudioBuffer, BufferCache};
use crate::bus::FALLBACK_BUS;
use crate::config::{AudioConfig, SpatialDefaults};
use crate::graph::{AudioGraph, NodeId, NodeKind, PannerNode};
use crate::mixer::Mixer;
use fade::PendingStop;
use occlusion::OcclusionState;
use oneshot::OneShot;
use serde::{Deserialize, Serialize};
use sonance_core::{EntityId, Vec3};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

pub const MIN_PITCH: f32 = 0.25;
pub const MAX_PITCH: f32 = 4.0;

/// Identity of a sound instance: the owning entity plus a slot name
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct InstanceKey {
    pub entity: EntityId,
    #[serde(default)]
    pub slot: String,
}

impl InstanceKey {
    pub fn new(entity: EntityId, slot: &str) -> Self {
        Self {
            entity,
            slot: slot.to_string(),
        }
    }

    /// The entity's unnamed primary sound
    pub fn primary(entity: EntityId) -> Self {
        Self::new(entity, "")
    }

    pub fn is_primary(&self) -> bool {
        self.slot.is_empty()
    }
}

impl fmt::Debug for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.slot.is_empty() {
            write!(f, "{}", self.entity)
        } else {
            write!(f, "{}/{}", self.entity, self.slot)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// Distance attenuation settings for a positional sound
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpatialParams {
    pub position: Vec3,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
}

impl Default for SpatialParams {
    fn default() -> Self {
        Self::with_defaults(Vec3::ZERO, &SpatialDefaults::default())
    }
}

impl SpatialParams {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn with_defaults(position: Vec3, defaults: &SpatialDefaults) -> Self {
        Self {
            position,
            ref_distance: defaults.ref_distance,
            max_distance: defaults.max_distance,
            rolloff_factor: defaults.rolloff_factor,
        }
    }

    fn node(&self) -> NodeKind {
        NodeKind::Panner(PannerNode {
            position: self.position,
            ref_distance: self.ref_distance,
            max_distance: self.max_distance,
            rolloff_factor: self.rolloff_factor,
        })
    }
}

/// Creation parameters for a sound instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceParams {
    pub volume: f32,
    pub pitch: f32,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub bus: String,
    pub spatial: Option<SpatialParams>,
}

impl Default for InstanceParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pitch: 1.0,
            looping: false,
            bus: FALLBACK_BUS.to_string(),
            spatial: None,
        }
    }
}

/// A live sound owned by an entity
pub struct SoundInstance {
    pub key: InstanceKey,
    pub asset_id: String,
    pub volume: f32,
    pub pitch: f32,
    pub looping: bool,
    pub bus: String,
    pub state: PlaybackState,
    /// Seconds into the buffer playback resumes from
    pub pause_offset: f64,
    buffer: Arc<AudioBuffer>,
    /// Clock time playback would have started at from offset 0
    start_time: f64,
    gain: NodeId,
    panner: Option<NodeId>,
    occlusion: Option<NodeId>,
    source: Option<NodeId>,
}

impl SoundInstance {
    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    pub fn is_spatial(&self) -> bool {
        self.panner.is_some()
    }

    pub fn gain_node(&self) -> NodeId {
        self.gain
    }

    pub fn panner_node(&self) -> Option<NodeId> {
        self.panner
    }

    pub fn occlusion_node(&self) -> Option<NodeId> {
        self.occlusion
    }

    pub fn source_node(&self) -> Option<NodeId> {
        self.source
    }

    /// Last node of the instance's own chain, the one wired to the bus
    pub fn output(&self) -> NodeId {
        self.occlusion.or(self.panner).unwrap_or(self.gain)
    }

    /// Rebuild `gain -> [panner] -> [occlusion]`, then reconnect the bus if
    /// the instance is currently audible
    fn rewire(&self, mixer: &mut Mixer) {
        let chain: Vec<NodeId> = [Some(self.gain), self.panner, self.occlusion]
            .into_iter()
            .flatten()
            .collect();
        for node in &chain {
            mixer.graph.disconnect(*node);
        }
        for pair in chain.windows(2) {
            let _ = mixer.graph.connect(pair[0], pair[1]);
        }
        if self.is_playing() {
            mixer.route(self.output(), &self.bus);
        }
    }

    /// Put the gain back at the instance volume. Only called once the
    /// source is gone, so any fade automation is inaudible history.
    fn reset_gain(&self, graph: &mut AudioGraph) {
        if let Some(gain) = graph.gain_param_mut(self.gain) {
            gain.set_value(self.volume);
        }
    }

    /// Stop and drop the playback node. Already-finished sources are fine.
    fn release_source(&mut self, graph: &mut AudioGraph) {
        if let Some(source) = self.source.take() {
            let _ = graph.stop_source(source);
            graph.remove_node(source);
        }
    }
}

pub struct SoundInstanceManager {
    instances: BTreeMap<InstanceKey, SoundInstance>,
    one_shots: VecDeque<OneShot>,
    next_one_shot: u64,
    pending_stops: Vec<PendingStop>,
    occlusion: HashMap<EntityId, OcclusionState>,
    config: AudioConfig,
}

impl SoundInstanceManager {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            instances: BTreeMap::new(),
            one_shots: VecDeque::new(),
            next_one_shot: 1,
            pending_stops: Vec::new(),
            occlusion: HashMap::new(),
            config: config.clone(),
        }
    }

    /// Create (or replace) the instance at `(entity, slot)`.
    ///
    /// Returns false without touching anything when the buffer is not
    /// loaded or when a new layer would exceed the per-entity cap.
    pub fn create_instance(
        &mut self,
        mixer: &mut Mixer,
        cache: &BufferCache,
        entity: EntityId,
        asset_id: &str,
        params: &InstanceParams,
        slot: &str,
    ) -> bool {
        let key = InstanceKey::new(entity, slot);
        let Some(buffer) = cache.get(asset_id) else {
            tracing::warn!("Audio: buffer '{asset_id}' not loaded, skipping sound for {key:?}");
            return false;
        };

        if !key.is_primary()
            && !self.instances.contains_key(&key)
            && self.layer_count(entity) >= self.config.max_layers_per_entity
        {
            tracing::warn!(
                "Audio: entity {entity} already has {} layers, rejecting '{slot}'",
                self.config.max_layers_per_entity
            );
            return false;
        }

        if self.instances.contains_key(&key) {
            self.teardown(mixer, &key);
        }

        let volume = params.volume.clamp(0.0, 1.0);
        let gain = mixer.graph.create_gain(volume);
        let panner = params.spatial.map(|s| mixer.graph.add_node(s.node()));
        let occlusion = self
            .occlusion
            .get(&entity)
            .map(|state| self.create_occlusion_filter(&mut mixer.graph, state));

        let instance = SoundInstance {
            key: key.clone(),
            asset_id: asset_id.to_string(),
            volume,
            pitch: params.pitch.clamp(MIN_PITCH, MAX_PITCH),
            looping: params.looping,
            bus: mixer.buses.resolve(&params.bus).to_string(),
            state: PlaybackState::Stopped,
            pause_offset: 0.0,
            buffer,
            start_time: 0.0,
            gain,
            panner,
            occlusion,
            source: None,
        };
        instance.rewire(mixer);
        self.instances.insert(key, instance);
        true
    }

    /// Destroy an instance. Destroying the primary slot also destroys every
    /// layer of the entity.
    pub fn destroy_instance(&mut self, mixer: &mut Mixer, entity: EntityId, slot: &str) -> bool {
        if !slot.is_empty() {
            return self.teardown(mixer, &InstanceKey::new(entity, slot));
        }

        let keys = self.keys_for_entity(entity);
        for key in &keys {
            self.teardown(mixer, key);
        }
        self.occlusion.remove(&entity);
        !keys.is_empty()
    }

    /// Start playback from the stored pause offset. No-op if already playing.
    pub fn play(&mut self, mixer: &mut Mixer, key: &InstanceKey) -> bool {
        if !self.instances.contains_key(key) {
            tracing::warn!("Audio: play on missing instance {key:?}");
            return false;
        }
        self.cancel_pending_stop(key);

        let Some(instance) = self.instances.get_mut(key) else {
            return false;
        };
        if instance.is_playing() {
            return false;
        }

        let now = mixer.now();
        let source = mixer
            .graph
            .create_source(instance.buffer.clone(), instance.looping, instance.pitch);
        let _ = mixer.graph.connect(source, instance.gain);
        mixer.route(instance.output(), &instance.bus);
        let _ = mixer.graph.start_source(source, instance.pause_offset);

        instance.source = Some(source);
        instance.start_time = now - instance.pause_offset;
        instance.state = PlaybackState::Playing;
        mixer.notify_play(&instance.bus);
        true
    }

    /// Remember the playback position and release the source.
    ///
    /// A paused sound no longer counts as playing on its bus, so ducking it
    /// triggered is released until [`SoundInstanceManager::resume`].
    pub fn pause(&mut self, mixer: &mut Mixer, key: &InstanceKey) -> bool {
        let Some(instance) = self.instances.get_mut(key) else {
            tracing::warn!("Audio: pause on missing instance {key:?}");
            return false;
        };
        if !instance.is_playing() {
            return false;
        }

        instance.pause_offset = (mixer.now() - instance.start_time).max(0.0);
        instance.release_source(&mut mixer.graph);
        instance.state = PlaybackState::Paused;
        mixer.notify_stop(&instance.bus);
        true
    }

    /// Continue from where [`SoundInstanceManager::pause`] left off
    pub fn resume(&mut self, mixer: &mut Mixer, key: &InstanceKey) -> bool {
        self.play(mixer, key)
    }

    /// Stop playback, rewind to the start and restore the gain to the
    /// instance volume, undoing any fade
    pub fn stop(&mut self, mixer: &mut Mixer, key: &InstanceKey) -> bool {
        self.cancel_pending_stop(key);
        let Some(instance) = self.instances.get_mut(key) else {
            tracing::warn!("Audio: stop on missing instance {key:?}");
            return false;
        };

        let was_playing = instance.is_playing();
        instance.release_source(&mut mixer.graph);
        instance.reset_gain(&mut mixer.graph);
        instance.pause_offset = 0.0;
        instance.state = PlaybackState::Stopped;
        if was_playing {
            mixer.notify_stop(&instance.bus);
        }
        true
    }

    /// Stop every instance without destroying any, and cancel one-shots
    pub fn stop_all(&mut self, mixer: &mut Mixer) {
        let keys: Vec<InstanceKey> = self.instances.keys().cloned().collect();
        for key in &keys {
            self.stop(mixer, key);
        }
        self.cancel_all_one_shots(mixer);
    }

    pub fn set_volume(&mut self, mixer: &mut Mixer, key: &InstanceKey, volume: f32) -> bool {
        let Some(instance) = self.instances.get_mut(key) else {
            tracing::warn!("Audio: set_volume on missing instance {key:?}");
            return false;
        };
        instance.volume = volume.clamp(0.0, 1.0);
        mixer
            .graph
            .ramp_gain(instance.gain, instance.volume, self.config.param_ramp());
        true
    }

    /// Set the playback rate, clamped to `[0.25, 4.0]`
    pub fn set_pitch(&mut self, mixer: &mut Mixer, key: &InstanceKey, pitch: f32) -> bool {
        let Some(instance) = self.instances.get_mut(key) else {
            tracing::warn!("Audio: set_pitch on missing instance {key:?}");
            return false;
        };
        instance.pitch = pitch.clamp(MIN_PITCH, MAX_PITCH);
        if let Some(source) = instance.source {
            mixer
                .graph
                .set_playback_rate(source, instance.pitch, self.config.param_ramp());
        }
        true
    }

    /// Move a spatial instance. Non-spatial instances ignore this.
    pub fn update_position(&mut self, mixer: &mut Mixer, key: &InstanceKey, position: Vec3) -> bool {
        let Some(panner) = self.instances.get(key).and_then(|i| i.panner) else {
            return false;
        };
        match mixer.graph.panner_mut(panner) {
            Some(node) => {
                node.position = position;
                true
            }
            None => false,
        }
    }

    /// Route an instance to a different bus, moving a live connection
    pub fn set_bus(&mut self, mixer: &mut Mixer, key: &InstanceKey, bus: &str) -> bool {
        let Some(instance) = self.instances.get_mut(key) else {
            tracing::warn!("Audio: set_bus on missing instance {key:?}");
            return false;
        };
        let bus = mixer.buses.resolve(bus).to_string();
        if instance.bus == bus {
            return true;
        }
        let previous = std::mem::replace(&mut instance.bus, bus);
        if instance.is_playing() {
            mixer.route(instance.output(), &instance.bus);
            mixer.notify_stop(&previous);
            mixer.notify_play(&instance.bus);
        }
        true
    }

    /// Move every instance and one-shot on `from` over to `to`. Live
    /// connections are switched without interrupting playback.
    pub fn reassign_bus(&mut self, mixer: &mut Mixer, from: &str, to: &str) -> usize {
        let mut moved = 0;
        for instance in self.instances.values_mut().filter(|i| i.bus == from) {
            instance.bus = to.to_string();
            if instance.is_playing() {
                mixer.route(instance.output(), to);
                mixer.notify_stop(from);
                mixer.notify_play(to);
            }
            moved += 1;
        }
        for shot in self.one_shots.iter_mut().filter(|s| s.bus == from) {
            shot.bus = to.to_string();
            mixer.route(shot.output(), to);
            mixer.notify_stop(from);
            mixer.notify_play(to);
            moved += 1;
        }
        if moved > 0 {
            tracing::debug!("Audio: moved {moved} sounds from '{from}' to '{to}'");
        }
        moved
    }

    /// Handle sources that reached the end of their buffer: one-shots are
    /// destroyed, non-looping instances become stopped.
    pub fn handle_ended(&mut self, mixer: &mut Mixer, ended: &[NodeId]) {
        if ended.is_empty() {
            return;
        }
        for instance in self.instances.values_mut() {
            let Some(source) = instance.source else {
                continue;
            };
            if !ended.contains(&source) {
                continue;
            }
            instance.release_source(&mut mixer.graph);
            instance.reset_gain(&mut mixer.graph);
            instance.pause_offset = 0.0;
            instance.state = PlaybackState::Stopped;
            mixer.notify_stop(&instance.bus);
        }
        self.reap_one_shots(mixer, ended);
    }

    /// Destroy every instance and one-shot; used when the simulation resets
    pub fn destroy_all(&mut self, mixer: &mut Mixer) {
        let keys: Vec<InstanceKey> = self.instances.keys().cloned().collect();
        for key in &keys {
            self.teardown(mixer, key);
        }
        self.cancel_all_one_shots(mixer);
        self.pending_stops.clear();
        self.occlusion.clear();
    }

    // --- Queries ---

    pub fn get(&self, key: &InstanceKey) -> Option<&SoundInstance> {
        self.instances.get(key)
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.instances.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn is_playing(&self, key: &InstanceKey) -> bool {
        self.instances.get(key).is_some_and(SoundInstance::is_playing)
    }

    pub fn playback_state(&self, key: &InstanceKey) -> Option<PlaybackState> {
        self.instances.get(key).map(|i| i.state)
    }

    /// Seconds of playback elapsed, accounting for pause/resume
    pub fn elapsed(&self, mixer: &Mixer, key: &InstanceKey) -> Option<f64> {
        let instance = self.instances.get(key)?;
        Some(match instance.state {
            PlaybackState::Playing => mixer.now() - instance.start_time,
            PlaybackState::Paused => instance.pause_offset,
            PlaybackState::Stopped => 0.0,
        })
    }

    pub fn instances_on_bus(&self, bus: &str) -> Vec<&InstanceKey> {
        self.instances
            .values()
            .filter(|i| i.bus == bus)
            .map(|i| &i.key)
            .collect()
    }

    pub fn keys_for_entity(&self, entity: EntityId) -> Vec<InstanceKey> {
        self.instances
            .keys()
            .filter(|k| k.entity == entity)
            .cloned()
            .collect()
    }

    /// Remove an instance, stopping playback before releasing its nodes
    fn teardown(&mut self, mixer: &mut Mixer, key: &InstanceKey) -> bool {
        self.cancel_pending_stop(key);
        let Some(mut instance) = self.instances.remove(key) else {
            return false;
        };

        let was_playing = instance.is_playing();
        instance.release_source(&mut mixer.graph);
        if was_playing {
            mixer.notify_stop(&instance.bus);
        }

        for node in [Some(instance.gain), instance.panner, instance.occlusion]
            .into_iter()
            .flatten()
        {
            mixer.graph.remove_node(node);
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sonance_core::ManualClock;

    pub(crate) struct Fixture {
        pub clock: ManualClock,
        pub mixer: Mixer,
        pub cache: BufferCache,
        pub sounds: SoundInstanceManager,
    }

    pub(crate) fn fixture() -> Fixture {
        let clock = ManualClock::new();
        let config = AudioConfig {
            sample_rate: 1_000,
            ..AudioConfig::default()
        };
        let mixer = Mixer::new(Arc::new(clock.clone()), &config);
        let mut cache = BufferCache::new();
        cache.insert("loop", AudioBuffer::silent(1_000, 10.0));
        cache.insert("blip", AudioBuffer::silent(1_000, 1.0));
        Fixture {
            clock,
            mixer,
            cache,
            sounds: SoundInstanceManager::new(&config),
        }
    }

    pub(crate) fn params(bus: &str) -> InstanceParams {
        InstanceParams {
            bus: bus.to_string(),
            looping: true,
            ..InstanceParams::default()
        }
    }

    pub(crate) const E1: EntityId = EntityId(1);

    impl Fixture {
        pub(crate) fn create(&mut self, entity: EntityId, slot: &str, bus: &str) -> InstanceKey {
            assert!(self.sounds.create_instance(
                &mut self.mixer,
                &self.cache,
                entity,
                "loop",
                &params(bus),
                slot,
            ));
            InstanceKey::new(entity, slot)
        }

        pub(crate) fn gain_target(&self, key: &InstanceKey) -> f32 {
            let node = self.sounds.get(key).unwrap().gain_node();
            self.mixer.graph.gain_param(node).unwrap().target_value()
        }
    }

    #[test]
    fn test_missing_buffer_is_soft_failure() {
        let mut f = fixture();
        let created = f.sounds.create_instance(
            &mut f.mixer,
            &f.cache,
            E1,
            "missing",
            &InstanceParams::default(),
            "",
        );
        assert!(!created);
        assert!(f.sounds.is_empty());
    }

    #[test]
    fn test_play_routes_through_bus() {
        let mut f = fixture();
        let key = f.create(E1, "", "music");
        assert!(f.sounds.play(&mut f.mixer, &key));

        let instance = f.sounds.get(&key).unwrap();
        let music = f.mixer.buses.get("music").unwrap().input();
        let source = instance.source_node().unwrap();
        assert!(f.mixer.graph.is_connected(source, instance.gain_node()));
        assert!(f.mixer.graph.is_connected(instance.output(), music));
        assert!(f.mixer.graph.reaches_destination(source));
        assert!(f.mixer.graph.is_source_playing(source));

        // Already playing: no new source
        assert!(!f.sounds.play(&mut f.mixer, &key));
        assert_eq!(f.sounds.get(&key).unwrap().source_node(), Some(source));
    }

    #[test]
    fn test_create_replaces_existing_key() {
        let mut f = fixture();
        let key = f.create(E1, "", "sfx");
        f.sounds.play(&mut f.mixer, &key);
        let old_gain = f.sounds.get(&key).unwrap().gain_node();

        f.create(E1, "", "sfx");
        assert_eq!(f.sounds.len(), 1);
        assert!(f.mixer.graph.node(old_gain).is_none());
        assert!(!f.sounds.is_playing(&key));
        assert_eq!(f.mixer.ducking.active_count("sfx"), 0);
    }

    #[test]
    fn test_pause_resume_round_trip() {
        let mut f = fixture();
        let key = f.create(E1, "", "sfx");
        f.clock.set(1.0);
        f.sounds.play(&mut f.mixer, &key);

        f.clock.set(3.5);
        assert!(f.sounds.pause(&mut f.mixer, &key));
        let instance = f.sounds.get(&key).unwrap();
        assert_eq!(instance.state, PlaybackState::Paused);
        assert!((instance.pause_offset - 2.5).abs() < 1e-9);
        assert!(instance.source_node().is_none());

        f.clock.set(10.0);
        assert!(f.sounds.resume(&mut f.mixer, &key));
        let source = f.sounds.get(&key).unwrap().source_node().unwrap();
        assert!((f.mixer.graph.source(source).unwrap().offset - 2.5).abs() < 1e-9);

        f.clock.set(11.0);
        let elapsed = f.sounds.elapsed(&f.mixer, &key).unwrap();
        assert!((elapsed - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_stop_rewinds() {
        let mut f = fixture();
        let key = f.create(E1, "", "sfx");
        f.sounds.play(&mut f.mixer, &key);
        f.clock.set(2.0);
        f.sounds.pause(&mut f.mixer, &key);
        f.sounds.stop(&mut f.mixer, &key);

        let instance = f.sounds.get(&key).unwrap();
        assert_eq!(instance.state, PlaybackState::Stopped);
        assert_eq!(instance.pause_offset, 0.0);
        assert_eq!(f.sounds.elapsed(&f.mixer, &key), Some(0.0));
    }

    #[test]
    fn test_missing_instance_operations_are_no_ops() {
        let mut f = fixture();
        let key = InstanceKey::primary(EntityId(99));
        assert!(!f.sounds.play(&mut f.mixer, &key));
        assert!(!f.sounds.pause(&mut f.mixer, &key));
        assert!(!f.sounds.stop(&mut f.mixer, &key));
        assert!(!f.sounds.resume(&mut f.mixer, &key));
    }

    #[test]
    fn test_destroy_stops_before_release() {
        let mut f = fixture();
        let key = f.create(E1, "", "voice");
        f.sounds.play(&mut f.mixer, &key);
        let nodes_with_instance = f.mixer.graph.node_count();
        assert_eq!(f.mixer.ducking.active_count("voice"), 1);

        assert!(f.sounds.destroy_instance(&mut f.mixer, E1, ""));
        assert!(!f.sounds.contains(&key));
        assert_eq!(f.mixer.ducking.active_count("voice"), 0);
        // gain + source gone
        assert_eq!(f.mixer.graph.node_count(), nodes_with_instance - 2);
    }

    #[test]
    fn test_pitch_and_volume_clamped() {
        let mut f = fixture();
        let key = f.create(E1, "", "sfx");
        f.sounds.play(&mut f.mixer, &key);

        f.sounds.set_pitch(&mut f.mixer, &key, 10.0);
        assert_eq!(f.sounds.get(&key).unwrap().pitch, MAX_PITCH);
        f.sounds.set_pitch(&mut f.mixer, &key, 0.0);
        assert_eq!(f.sounds.get(&key).unwrap().pitch, MIN_PITCH);

        f.sounds.set_volume(&mut f.mixer, &key, 3.0);
        assert_eq!(f.gain_target(&key), 1.0);
        f.sounds.set_volume(&mut f.mixer, &key, 0.25);
        assert_eq!(f.gain_target(&key), 0.25);
    }

    #[test]
    fn test_spatial_position_updates() {
        let mut f = fixture();
        let spatial = InstanceParams {
            spatial: Some(SpatialParams::at(Vec3::new(2.0, 0.0, 0.0))),
            ..InstanceParams::default()
        };
        f.sounds
            .create_instance(&mut f.mixer, &f.cache, E1, "loop", &spatial, "");
        let key = InstanceKey::primary(E1);
        f.create(EntityId(2), "", "sfx");

        assert!(f.sounds.get(&key).unwrap().is_spatial());
        assert!(f.sounds.update_position(&mut f.mixer, &key, Vec3::new(4.0, 0.0, 0.0)));
        assert!(!f.sounds.update_position(
            &mut f.mixer,
            &InstanceKey::primary(EntityId(2)),
            Vec3::ONE
        ));

        f.sounds.play(&mut f.mixer, &key);
        let source = f.sounds.get(&key).unwrap().source_node().unwrap();
        let gain = f.mixer.graph.audible_gain(source, 100.0).unwrap();
        assert!((gain - 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_natural_end_stops_instance() {
        let mut f = fixture();
        let once = InstanceParams {
            bus: "voice".into(),
            ..InstanceParams::default()
        };
        f.sounds
            .create_instance(&mut f.mixer, &f.cache, E1, "blip", &once, "");
        let key = InstanceKey::primary(E1);
        f.sounds.play(&mut f.mixer, &key);
        assert_eq!(f.mixer.ducking.active_count("voice"), 1);

        f.clock.set(2.0);
        let ended = f.mixer.graph.collect_ended_sources();
        f.sounds.handle_ended(&mut f.mixer, &ended);
        assert_eq!(f.sounds.playback_state(&key), Some(PlaybackState::Stopped));
        assert_eq!(f.mixer.ducking.active_count("voice"), 0);
    }

    #[test]
    fn test_reassign_moves_live_connection() {
        let mut f = fixture();
        let playing = f.create(E1, "", "ambient");
        let idle = f.create(EntityId(2), "", "ambient");
        f.sounds.play(&mut f.mixer, &playing);

        let moved = f.sounds.reassign_bus(&mut f.mixer, "ambient", "sfx");
        assert_eq!(moved, 2);
        assert!(f.sounds.instances_on_bus("ambient").is_empty());
        assert_eq!(f.sounds.get(&idle).unwrap().bus, "sfx");

        let instance = f.sounds.get(&playing).unwrap();
        let sfx = f.mixer.buses.get("sfx").unwrap().input();
        assert_eq!(f.mixer.graph.outputs(instance.output()), &[sfx]);
        assert!(instance.is_playing());
        assert_eq!(f.mixer.ducking.active_count("ambient"), 0);
        assert_eq!(f.mixer.ducking.active_count("sfx"), 1);
    }

    #[test]
    fn test_unknown_bus_records_resolved_name() {
        let mut f = fixture();
        f.mixer
            .ducking
            .add_rule(crate::ducking::DuckingRule::new("sfx", "music", 0.5));
        let key = f.create(E1, "", "nowhere");
        assert_eq!(f.sounds.get(&key).unwrap().bus, "sfx");

        f.sounds.play(&mut f.mixer, &key);
        assert_eq!(f.mixer.ducking.active_count("sfx"), 1);
        assert_eq!(f.mixer.ducking.active_count("nowhere"), 0);
        assert_eq!(f.sounds.instances_on_bus("sfx"), vec![&key]);
        let music_duck = f.mixer.buses.get("music").unwrap().duck_node();
        assert_eq!(f.mixer.graph.gain_param(music_duck).unwrap().target_value(), 0.5);

        f.sounds.set_bus(&mut f.mixer, &key, "ambient");
        f.sounds.set_bus(&mut f.mixer, &key, "elsewhere");
        assert_eq!(f.sounds.get(&key).unwrap().bus, "sfx");
        assert_eq!(f.mixer.ducking.active_count("sfx"), 1);
        assert_eq!(f.mixer.ducking.active_count("elsewhere"), 0);
    }

    #[test]
    fn test_destroy_all() {
        let mut f = fixture();
        let a = f.create(E1, "", "sfx");
        f.create(E1, "engine", "sfx");
        f.create(EntityId(2), "", "voice");
        f.sounds.play(&mut f.mixer, &a);

        f.sounds.destroy_all(&mut f.mixer);
        assert!(f.sounds.is_empty());
        assert_eq!(f.mixer.ducking.active_count("sfx"), 0);
        // Only the bus nodes remain
        assert_eq!(f.mixer.graph.node_count(), f.mixer.buses.len() * 2);
    }
}
