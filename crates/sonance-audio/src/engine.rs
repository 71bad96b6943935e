//! The audio engine: owns the buffer cache, the mixer, every sound instance
//! and the music sequencer
//!
//! Hosts call [`AudioEngine::update`] once per frame. Everything else is a
//! direct command that either applies immediately or logs and does nothing.

use crate::buffer::{AudioBuffer, BufferCache};
use crate::bus::{Bus, BusConfig};
use crate::config::AudioConfig;
use crate::ducking::DuckingRule;
use crate::effect::EffectDef;
use crate::graph::AudioGraph;
use crate::instance::{
    InstanceKey, InstanceParams, LayerOptions, OneShotOptions, PlaybackState, SoundInstanceManager,
};
use crate::mixer::Mixer;
use crate::music::{AdaptiveMusicSequencer, MusicSegment};
use crate::output::AudioOutput;
use sonance_core::{Clock, EntityId, OneShotId, Result, SystemClock, Vec3};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct AudioEngine {
    config: AudioConfig,
    cache: BufferCache,
    mixer: Mixer,
    sounds: SoundInstanceManager,
    music: AdaptiveMusicSequencer,
    output: AudioOutput,
}

impl Default for AudioEngine {
    fn default() -> Self {
        Self::new(AudioConfig::default())
    }
}

impl AudioEngine {
    /// Engine driven by the wall clock, playing on the default device when
    /// there is one
    pub fn new(config: AudioConfig) -> Self {
        let output = AudioOutput::open(&config.output);
        Self::with_output(config, Arc::new(SystemClock::new()), output)
    }

    /// Silent engine driven by an external clock
    pub fn with_clock(config: AudioConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_output(config, clock, AudioOutput::silent())
    }

    /// Engine driven by an external clock, typically the host's audio clock,
    /// rendering through `output`
    pub fn with_output(config: AudioConfig, clock: Arc<dyn Clock>, output: AudioOutput) -> Self {
        let mixer = Mixer::new(clock, &config);
        let sounds = SoundInstanceManager::new(&config);
        let music = AdaptiveMusicSequencer::new(&config);
        Self {
            config,
            cache: BufferCache::new(),
            mixer,
            sounds,
            music,
            output,
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn now(&self) -> f64 {
        self.mixer.now()
    }

    /// Whether sound reaches a device
    pub fn is_output_available(&self) -> bool {
        self.output.is_available()
    }

    /// Per-frame poll: reap finished sources, run deferred stops, fire due
    /// music events, then render the result to the device
    pub fn update(&mut self) {
        let ended = self.mixer.graph.collect_ended_sources();
        self.sounds.handle_ended(&mut self.mixer, &ended);
        self.sounds.run_pending_stops(&mut self.mixer);
        self.music.update(&mut self.mixer.graph);
        self.output.render(&self.mixer, &self.music);
    }

    // --- Buffers ---

    /// Decode and cache an encoded asset. The only hard failure the engine
    /// surfaces.
    pub fn load_buffer(&mut self, asset_id: &str, bytes: Vec<u8>) -> Result<()> {
        self.cache.load_buffer(asset_id, bytes)
    }

    pub fn load_file(&mut self, asset_id: &str, path: &Path) -> Result<()> {
        self.cache.load_file(asset_id, path)
    }

    /// Cache PCM the host already decoded
    pub fn insert_buffer(&mut self, asset_id: &str, buffer: AudioBuffer) {
        self.cache.insert(asset_id, buffer);
    }

    pub fn buffers(&self) -> &BufferCache {
        &self.cache
    }

    // --- Buses ---

    pub fn create_bus(&mut self, name: &str, volume: f32) -> bool {
        let created = self.mixer.buses.create_bus(&mut self.mixer.graph, name, volume);
        if !created {
            tracing::warn!("Audio: cannot create bus '{name}'");
        }
        created
    }

    /// Delete a bus, moving its sounds to the fallback bus first
    pub fn delete_bus(&mut self, name: &str) -> bool {
        if !self.mixer.buses.can_delete(name) {
            tracing::warn!("Audio: cannot delete bus '{name}'");
            return false;
        }
        let fallback = self.mixer.buses.fallback_for(name).to_string();
        self.sounds.reassign_bus(&mut self.mixer, name, &fallback);
        self.mixer.buses.delete_bus(&mut self.mixer.graph, name)
    }

    pub fn set_bus_volume(&mut self, name: &str, volume: f32) -> bool {
        self.mixer.buses.set_bus_volume(&mut self.mixer.graph, name, volume)
    }

    pub fn mute_bus(&mut self, name: &str, muted: bool) -> bool {
        self.mixer.buses.mute_bus(&mut self.mixer.graph, name, muted)
    }

    pub fn solo_bus(&mut self, name: &str, soloed: bool) -> bool {
        self.mixer.buses.solo_bus(&mut self.mixer.graph, name, soloed)
    }

    pub fn set_bus_effects(&mut self, name: &str, effects: &[EffectDef]) -> bool {
        self.mixer
            .buses
            .set_bus_effects(&mut self.mixer.graph, name, effects)
    }

    /// Reconcile the mixer against a complete bus list.
    ///
    /// Configured buses are created or updated first. Sounds on buses the
    /// config drops then move to the fallback of the final bus set, and
    /// only after that are the dropped buses torn down.
    pub fn apply_bus_config(&mut self, configs: &[BusConfig]) {
        let stale = self.mixer.buses.stale_buses(configs);
        self.mixer.buses.configure(&mut self.mixer.graph, configs);

        let fallback = self.mixer.buses.fallback_excluding(&stale);
        for name in &stale {
            self.sounds.reassign_bus(&mut self.mixer, name, fallback);
        }
        self.mixer.buses.remove_buses(&mut self.mixer.graph, &stale);
        self.mixer.buses.recompute_gains(&mut self.mixer.graph);
    }

    pub fn bus(&self, name: &str) -> Option<&Bus> {
        self.mixer.buses.get(name)
    }

    pub fn bus_names(&self) -> Vec<&str> {
        self.mixer.buses.names()
    }

    // --- Ducking ---

    pub fn add_ducking_rule(&mut self, rule: DuckingRule) {
        self.mixer.ducking.add_rule(rule);
    }

    pub fn remove_ducking_rule(&mut self, trigger_bus: &str, target_bus: &str) -> bool {
        let Mixer {
            graph,
            buses,
            ducking,
        } = &mut self.mixer;
        ducking.remove_rule(graph, buses, trigger_bus, target_bus)
    }

    pub fn ducking_rules(&self) -> &[DuckingRule] {
        self.mixer.ducking.rules()
    }

    pub fn active_trigger_count(&self, bus: &str) -> u32 {
        self.mixer.ducking.active_count(bus)
    }

    // --- Listener ---

    pub fn set_listener(&mut self, position: Vec3) {
        self.mixer.graph.set_listener(position);
    }

    pub fn listener(&self) -> Vec3 {
        self.mixer.graph.listener()
    }

    // --- Sound instances ---

    pub fn create_instance(
        &mut self,
        entity: EntityId,
        asset_id: &str,
        params: &InstanceParams,
        slot: &str,
    ) -> bool {
        self.sounds
            .create_instance(&mut self.mixer, &self.cache, entity, asset_id, params, slot)
    }

    pub fn destroy_instance(&mut self, entity: EntityId, slot: &str) -> bool {
        self.sounds.destroy_instance(&mut self.mixer, entity, slot)
    }

    pub fn play(&mut self, entity: EntityId, slot: &str) -> bool {
        self.sounds
            .play(&mut self.mixer, &InstanceKey::new(entity, slot))
    }

    pub fn pause(&mut self, entity: EntityId, slot: &str) -> bool {
        self.sounds
            .pause(&mut self.mixer, &InstanceKey::new(entity, slot))
    }

    pub fn resume(&mut self, entity: EntityId, slot: &str) -> bool {
        self.sounds
            .resume(&mut self.mixer, &InstanceKey::new(entity, slot))
    }

    pub fn stop(&mut self, entity: EntityId, slot: &str) -> bool {
        self.sounds
            .stop(&mut self.mixer, &InstanceKey::new(entity, slot))
    }

    pub fn set_volume(&mut self, entity: EntityId, slot: &str, volume: f32) -> bool {
        self.sounds
            .set_volume(&mut self.mixer, &InstanceKey::new(entity, slot), volume)
    }

    pub fn set_pitch(&mut self, entity: EntityId, slot: &str, pitch: f32) -> bool {
        self.sounds
            .set_pitch(&mut self.mixer, &InstanceKey::new(entity, slot), pitch)
    }

    pub fn update_position(&mut self, entity: EntityId, slot: &str, position: Vec3) -> bool {
        self.sounds
            .update_position(&mut self.mixer, &InstanceKey::new(entity, slot), position)
    }

    pub fn set_instance_bus(&mut self, entity: EntityId, slot: &str, bus: &str) -> bool {
        self.sounds
            .set_bus(&mut self.mixer, &InstanceKey::new(entity, slot), bus)
    }

    pub fn add_layer(
        &mut self,
        entity: EntityId,
        slot: &str,
        asset_id: &str,
        options: &LayerOptions,
    ) -> bool {
        self.sounds
            .add_layer(&mut self.mixer, &self.cache, entity, slot, asset_id, options)
    }

    pub fn remove_layer(&mut self, entity: EntityId, slot: &str) -> bool {
        self.sounds.remove_layer(&mut self.mixer, entity, slot)
    }

    pub fn remove_all_layers(&mut self, entity: EntityId) -> usize {
        self.sounds.remove_all_layers(&mut self.mixer, entity)
    }

    pub fn play_one_shot(&mut self, asset_id: &str, options: &OneShotOptions) -> Option<OneShotId> {
        self.sounds
            .play_one_shot(&mut self.mixer, &self.cache, asset_id, options)
    }

    pub fn cancel_one_shot(&mut self, id: OneShotId) -> bool {
        self.sounds.cancel_one_shot(&mut self.mixer, id)
    }

    pub fn cancel_all_one_shots(&mut self) {
        self.sounds.cancel_all_one_shots(&mut self.mixer);
    }

    pub fn crossfade(&mut self, from: &InstanceKey, to: &InstanceKey, duration: Duration) -> bool {
        self.sounds.crossfade(&mut self.mixer, from, to, duration)
    }

    pub fn fade_in(&mut self, key: &InstanceKey, duration: Duration) -> bool {
        self.sounds.fade_in(&mut self.mixer, key, duration)
    }

    pub fn fade_out(&mut self, key: &InstanceKey, duration: Duration, stop_after: bool) -> bool {
        self.sounds
            .fade_out(&mut self.mixer, key, duration, stop_after)
    }

    pub fn set_occlusion(&mut self, entity: EntityId, enabled: bool) -> bool {
        self.sounds.set_occlusion(&mut self.mixer, entity, enabled)
    }

    pub fn update_occlusion_state(&mut self, entity: EntityId, occluded: bool) -> bool {
        self.sounds
            .update_occlusion_state(&mut self.mixer, entity, occluded)
    }

    pub fn is_playing(&self, entity: EntityId, slot: &str) -> bool {
        self.sounds.is_playing(&InstanceKey::new(entity, slot))
    }

    pub fn playback_state(&self, entity: EntityId, slot: &str) -> Option<PlaybackState> {
        self.sounds.playback_state(&InstanceKey::new(entity, slot))
    }

    pub fn elapsed(&self, entity: EntityId, slot: &str) -> Option<f64> {
        self.sounds
            .elapsed(&self.mixer, &InstanceKey::new(entity, slot))
    }

    /// Stop every sound and the music without destroying anything
    pub fn stop_all(&mut self) {
        self.sounds.stop_all(&mut self.mixer);
        self.music.stop(&mut self.mixer.graph);
    }

    /// Destroy every instance and one-shot, e.g. when leaving play mode
    pub fn destroy_all(&mut self) {
        self.sounds.destroy_all(&mut self.mixer);
        let Mixer {
            graph,
            buses,
            ducking,
        } = &mut self.mixer;
        ducking.reset(graph, buses);
    }

    pub fn sounds(&self) -> &SoundInstanceManager {
        &self.sounds
    }

    pub fn graph(&self) -> &AudioGraph {
        &self.mixer.graph
    }

    // --- Music ---

    pub fn music(&self) -> &AdaptiveMusicSequencer {
        &self.music
    }

    pub fn load_stem_set<I>(&mut self, stems: I)
    where
        I: IntoIterator<Item = (String, Arc<AudioBuffer>)>,
    {
        self.music.load_stem_set(&mut self.mixer.graph, stems);
    }

    /// Load stems from cached buffers, given `(stem name, asset id)` pairs.
    /// Returns how many stems were loaded.
    pub fn load_stems_from_cache<'a, I>(&mut self, stems: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut found = Vec::new();
        for (name, asset_id) in stems {
            match self.cache.get(asset_id) {
                Some(buffer) => found.push((name.to_string(), buffer)),
                None => tracing::warn!("Audio: buffer '{asset_id}' not loaded, skipping stem '{name}'"),
            }
        }
        let count = found.len();
        self.music.load_stem_set(&mut self.mixer.graph, found);
        count
    }

    pub fn set_intensity(&mut self, level: f32) {
        self.music.set_intensity(&mut self.mixer.graph, level);
    }

    pub fn set_bpm(&mut self, bpm: f32) {
        self.music.set_bpm(bpm);
    }

    pub fn play_music(&mut self) -> bool {
        self.music.play(&mut self.mixer.graph)
    }

    pub fn stop_music(&mut self) {
        self.music.stop(&mut self.mixer.graph);
    }

    pub fn set_segments(&mut self, segments: Vec<MusicSegment>) {
        self.music.set_segments(segments);
    }

    pub fn transition_to_segment(&mut self, name: &str, quantized: bool) -> bool {
        self.music
            .transition_to_segment(&mut self.mixer.graph, name, quantized)
    }

    pub fn music_crossfade(&mut self, duration: Duration) {
        self.music.crossfade(&mut self.mixer.graph, duration);
    }
}
