//! Device output: the mixer rendered through Kira
//!
//! The control graph stays the record of what should be heard.
//! [`AudioOutput::render`] runs once per engine update and brings Kira in
//! line with it:
//! - every bus is a duck track holding a chain track that carries the bus
//!   effects and the bus gain; master hangs off the main track and every
//!   other bus off master's chain
//! - every playing source is a `StaticSoundData` on its own sub-track of the
//!   bus it routes to (a spatial sub-track when it has a panner), with a
//!   low-pass filter that only bites while occlusion is on
//! - the music sequencer drives a Kira clock, so a quantized segment jump
//!   starts the new stems on the beat tick itself
//!
//! Parameter ramps are handed to Kira as tweens lasting until the ramp's end
//! time. Without a device the output is inert and the engine runs silent.

mod effects;

pub use effects::{ConvolutionBuilder, FeedbackDelayBuilder};

use crate::buffer::AudioBuffer;
use crate::bus::{Bus, BusGraph, MASTER_BUS};
use crate::config::OutputConfig;
use crate::effect::{EffectInstance, EffectParams, EffectType};
use crate::graph::{AudioGraph, AudioParam, FilterKind, NodeId, NodeKind, SourceNode};
use crate::mixer::Mixer;
use crate::music::{AdaptiveMusicSequencer, MusicSegment};
use kira::backend::Backend;
use kira::clock::{ClockHandle, ClockSpeed};
use kira::effect::compressor::CompressorBuilder;
use kira::effect::filter::{FilterBuilder, FilterHandle, FilterMode};
use kira::listener::ListenerHandle;
use kira::sound::static_sound::{StaticSoundData, StaticSoundHandle};
use kira::sound::{PlaybackPosition, PlaybackState};
use kira::track::{
    SpatialTrackBuilder, SpatialTrackDistances, SpatialTrackHandle, TrackBuilder, TrackHandle,
};
use kira::{
    AudioManager, AudioManagerSettings, Capacities, Decibels, DefaultBackend, Easing, Mix,
    PlaybackRate, StartTime, Tween,
};
use sonance_core::Vec3;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Smooth tween for changes that carry no ramp of their own (avoids clicks)
const PARAM_TWEEN: Tween = Tween {
    duration: Duration::from_millis(16),
    easing: Easing::Linear,
    start_time: StartTime::Immediate,
};

const INSTANT: Tween = Tween {
    duration: Duration::ZERO,
    easing: Easing::Linear,
    start_time: StartTime::Immediate,
};

/// Longest source-to-bus path followed before giving up on a route
const MAX_ROUTE_HOPS: usize = 16;

/// Convert linear amplitude to decibels, -60 dB being silence
pub fn amplitude_to_db(amplitude: f64) -> Decibels {
    if amplitude <= 0.0 {
        Decibels(-60.0)
    } else {
        Decibels((20.0 * (amplitude as f32).log10()).max(-60.0))
    }
}

/// Biquad Q to Kira's 0..1 filter resonance (`r = 1 - 1 / 2Q`)
fn resonance(q: f32) -> f64 {
    (1.0 - 0.5 / q.max(0.5) as f64).clamp(0.0, 0.99)
}

/// Last value handed to a Kira parameter and the clock time its ramp ends
#[derive(Debug, Clone, Copy, PartialEq)]
struct Pushed {
    value: f32,
    end: f64,
}

impl Pushed {
    fn of(param: &AudioParam) -> Self {
        Self {
            value: param.target_value(),
            end: param.end_time().unwrap_or(f64::NEG_INFINITY),
        }
    }

    /// Store in `slot`; true when that changed what Kira was last told
    fn replace(self, slot: &mut Option<Pushed>) -> bool {
        if *slot == Some(self) {
            return false;
        }
        *slot = Some(self);
        true
    }

    fn tween(&self, now: f64) -> Tween {
        let remaining = self.end - now;
        if remaining > 0.0 {
            Tween {
                duration: Duration::from_secs_f64(remaining),
                ..PARAM_TWEEN
            }
        } else {
            PARAM_TWEEN
        }
    }
}

/// Where a source's signal ends up
#[derive(Debug, Clone, PartialEq)]
enum Target {
    Main,
    Bus(String),
}

/// The nodes between a source and its bus
#[derive(Debug, Clone, PartialEq)]
struct Route {
    gains: Vec<NodeId>,
    panner: Option<NodeId>,
    filter: Option<NodeId>,
    target: Target,
}

impl Route {
    /// Follow first outputs from `source` to a bus input or the destination.
    /// None when the source is unplugged.
    fn trace(graph: &AudioGraph, source: NodeId, bus_inputs: &HashMap<NodeId, &str>) -> Option<Self> {
        let mut route = Route {
            gains: Vec::new(),
            panner: None,
            filter: None,
            target: Target::Main,
        };
        let mut node = source;
        for _ in 0..MAX_ROUTE_HOPS {
            let next = *graph.outputs(node).first()?;
            if next == NodeId::DESTINATION {
                return Some(route);
            }
            if let Some(bus) = bus_inputs.get(&next) {
                route.target = Target::Bus(bus.to_string());
                return Some(route);
            }
            match graph.node(next)? {
                NodeKind::Gain { .. } => route.gains.push(next),
                NodeKind::Panner(_) => route.panner = Some(next),
                NodeKind::Filter(_) => route.filter = Some(next),
                _ => {}
            }
            node = next;
        }
        None
    }

    /// Combined gain of the route, ending when its slowest ramp ends
    fn volume(&self, graph: &AudioGraph) -> Pushed {
        self.gains
            .iter()
            .filter_map(|&id| graph.gain_param(id))
            .map(Pushed::of)
            .fold(
                Pushed {
                    value: 1.0,
                    end: f64::NEG_INFINITY,
                },
                |acc, p| Pushed {
                    value: acc.value * p.value,
                    end: acc.end.max(p.end),
                },
            )
    }

    fn current_volume(&self, graph: &AudioGraph, now: f64) -> f32 {
        self.gains
            .iter()
            .filter_map(|&id| graph.gain_param(id))
            .map(|p| p.value_at(now))
            .product()
    }
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    position: Vec3,
    ref_distance: f32,
    max_distance: f32,
}

/// Everything needed to start a sound on Kira
struct VoicePlan<'a> {
    buffer: &'a AudioBuffer,
    looping: bool,
    /// Seconds into the buffer
    position: f64,
    start_time: StartTime,
    target: Target,
    placement: Option<Placement>,
    volume: f32,
    rate: f32,
    /// Cutoff and Q of an occlusion filter
    filter: Option<(f32, f32)>,
}

enum VoiceTrack {
    Plain(TrackHandle),
    Spatial(SpatialTrackHandle),
}

impl VoiceTrack {
    fn play(&mut self, data: StaticSoundData) -> Result<StaticSoundHandle, String> {
        match self {
            VoiceTrack::Plain(track) => track.play(data).map_err(|e| e.to_string()),
            VoiceTrack::Spatial(track) => track.play(data).map_err(|e| e.to_string()),
        }
    }

    fn set_position(&mut self, position: Vec3) {
        if let VoiceTrack::Spatial(track) = self {
            track.set_position(position, PARAM_TWEEN);
        }
    }
}

/// One playing source on the device
struct Voice {
    target: Target,
    /// Generation of the bus tracks the voice was created under
    epoch: u64,
    sound: StaticSoundHandle,
    filter: FilterHandle,
    track: VoiceTrack,
    volume: Option<Pushed>,
    rate: Option<Pushed>,
    cutoff: Option<Pushed>,
    filtered: Option<bool>,
    position: Option<Vec3>,
    /// Silenced ahead of a quantized jump, so volume updates wait
    held: bool,
}

impl Voice {
    fn sync(&mut self, graph: &AudioGraph, route: &Route, source: &SourceNode, now: f64) {
        let volume = route.volume(graph);
        if !self.held && volume.replace(&mut self.volume) {
            self.sound
                .set_volume(amplitude_to_db(volume.value as f64), volume.tween(now));
        }

        let rate = Pushed::of(&source.playback_rate);
        if rate.replace(&mut self.rate) {
            self.sound
                .set_playback_rate(PlaybackRate(rate.value as f64), rate.tween(now));
        }

        let filter = route.filter.and_then(|id| match graph.node(id) {
            Some(NodeKind::Filter(filter)) => Some(filter),
            _ => None,
        });
        if let Some(filter) = filter {
            let cutoff = Pushed::of(&filter.frequency);
            if cutoff.replace(&mut self.cutoff) {
                self.filter.set_cutoff(cutoff.value as f64, cutoff.tween(now));
            }
        }
        let filtered = filter.is_some();
        if self.filtered != Some(filtered) {
            self.filtered = Some(filtered);
            let mix = if filtered { Mix::WET } else { Mix::DRY };
            self.filter.set_mix(mix, PARAM_TWEEN);
        }

        let position = route.panner.and_then(|id| match graph.node(id) {
            Some(NodeKind::Panner(panner)) => Some(panner.position),
            _ => None,
        });
        if let Some(position) = position {
            if self.position != Some(position) {
                self.position = Some(position);
                self.track.set_position(position);
            }
        }
    }

    fn stop(&mut self) {
        self.sound.stop(PARAM_TWEEN);
    }
}

/// A bus as Kira tracks: `duck` contains `chain`, voices play on `chain`
struct BusTracks {
    effects: Vec<(EffectType, EffectParams)>,
    epoch: u64,
    chain: TrackHandle,
    duck: TrackHandle,
    gain: Option<Pushed>,
    duck_level: Option<Pushed>,
}

/// A quantized jump whose stems wait on a clock tick
struct QueuedSeek {
    at: f64,
    segment: String,
    voices: HashMap<String, Voice>,
}

struct BeatClock {
    clock: ClockHandle,
    bpm: f32,
    running: bool,
    /// Stem timeline start the tick grid was last aligned to
    anchor: f64,
    queued: Option<QueuedSeek>,
}

/// Effect signature of a bus; a change means rebuilding its tracks
fn effect_signature(bus: &Bus) -> Vec<(EffectType, EffectParams)> {
    bus.chain()
        .iter()
        .map(|e| (e.effect_type.clone(), e.params.clone()))
        .collect()
}

/// Add the Kira counterpart of a constructed bus effect, reading its
/// settings back from the graph
fn add_bus_effect(builder: &mut TrackBuilder, effect: &EffectInstance, graph: &AudioGraph) {
    let gain_at = |index: usize| {
        effect
            .nodes()
            .get(index)
            .and_then(|&id| graph.gain_param(id))
            .map(AudioParam::target_value)
    };
    let node_at = |index: usize| effect.nodes().get(index).and_then(|&id| graph.node(id));

    match &effect.effect_type {
        EffectType::Reverb => {
            if let (Some(NodeKind::Convolver { impulse }), Some(wet)) = (node_at(2), gain_at(3)) {
                builder.add_effect(ConvolutionBuilder::new(impulse.clone(), wet));
            }
        }
        EffectType::Lowpass | EffectType::Highpass => {
            if let Some(NodeKind::Filter(filter)) = node_at(0) {
                let mode = match filter.kind {
                    FilterKind::Lowpass => FilterMode::LowPass,
                    FilterKind::Highpass => FilterMode::HighPass,
                };
                builder.add_effect(
                    FilterBuilder::new()
                        .mode(mode)
                        .cutoff(filter.frequency.target_value() as f64)
                        .resonance(resonance(filter.q.target_value())),
                );
            }
        }
        EffectType::Compressor => {
            if let Some(NodeKind::Compressor(compressor)) = node_at(0) {
                builder.add_effect(
                    CompressorBuilder::new()
                        .threshold(compressor.threshold as f64)
                        .ratio(compressor.ratio as f64)
                        .attack_duration(Duration::from_secs_f32(compressor.attack))
                        .release_duration(Duration::from_secs_f32(compressor.release)),
                );
            }
        }
        EffectType::Delay => {
            let time = match node_at(1) {
                Some(NodeKind::Delay { delay_time, .. }) => Some(delay_time.target_value()),
                _ => None,
            };
            if let (Some(time), Some(feedback), Some(wet)) = (time, gain_at(2), gain_at(3)) {
                builder.add_effect(FeedbackDelayBuilder::new(time, feedback, wet));
            }
        }
        EffectType::Passthrough(_) => {}
    }
}

/// Create the track for `plan` and start its sound
fn spawn_voice<B: Backend>(
    manager: &mut AudioManager<B>,
    buses: &mut HashMap<String, BusTracks>,
    listener: Option<&ListenerHandle>,
    plan: VoicePlan<'_>,
) -> Result<Voice, String> {
    let (cutoff, q, mix) = match plan.filter {
        Some((cutoff, q)) => (cutoff, q, Mix::WET),
        None => (20_000.0, 0.7071, Mix::DRY),
    };
    let filter_builder = FilterBuilder::new()
        .mode(FilterMode::LowPass)
        .cutoff(cutoff as f64)
        .resonance(resonance(q))
        .mix(mix);

    let epoch = match &plan.target {
        Target::Main => 0,
        Target::Bus(name) => buses.get(name).map_or(0, |b| b.epoch),
    };
    let parent = match &plan.target {
        Target::Main => None,
        Target::Bus(name) => Some(
            buses
                .get_mut(name)
                .map(|b| &mut b.chain)
                .ok_or_else(|| format!("bus '{name}' has no track"))?,
        ),
    };

    let (mut track, filter) = match (plan.placement, listener) {
        (Some(placement), Some(listener)) => {
            let mut builder = SpatialTrackBuilder::new()
                .distances(SpatialTrackDistances {
                    min_distance: placement.ref_distance,
                    max_distance: placement.max_distance,
                })
                .attenuation_function(Some(Easing::OutPowf(2.0)));
            let filter = builder.add_effect(filter_builder);
            let track = match parent {
                Some(parent) => {
                    parent.add_spatial_sub_track(listener.id(), placement.position, builder)
                }
                None => manager.add_spatial_sub_track(listener.id(), placement.position, builder),
            }
            .map_err(|e| e.to_string())?;
            (VoiceTrack::Spatial(track), filter)
        }
        _ => {
            let mut builder = TrackBuilder::new();
            let filter = builder.add_effect(filter_builder);
            let track = match parent {
                Some(parent) => parent.add_sub_track(builder),
                None => manager.add_sub_track(builder),
            }
            .map_err(|e| e.to_string())?;
            (VoiceTrack::Plain(track), filter)
        }
    };

    let mut data = plan
        .buffer
        .sound_data()
        .volume(amplitude_to_db(plan.volume as f64))
        .playback_rate(PlaybackRate(plan.rate as f64))
        .start_position(PlaybackPosition::Seconds(plan.position.max(0.0)))
        .start_time(plan.start_time);
    if plan.looping {
        data = data.loop_region(..);
    }
    let sound = track.play(data)?;

    Ok(Voice {
        target: plan.target,
        epoch,
        sound,
        filter,
        track,
        volume: None,
        rate: None,
        cutoff: None,
        filtered: Some(plan.filter.is_some()),
        position: plan.placement.map(|p| p.position),
        held: false,
    })
}

/// Kira state for an open device
struct Device<B: Backend> {
    manager: AudioManager<B>,
    listener: Option<ListenerHandle>,
    listener_position: Vec3,
    buses: HashMap<String, BusTracks>,
    voices: HashMap<NodeId, Voice>,
    /// Stopped voices kept until their fade-out finishes
    retired: Vec<Voice>,
    /// Sources whose sound could not be started
    skipped: HashSet<NodeId>,
    next_epoch: u64,
    beat: Option<BeatClock>,
}

impl<B: Backend> Device<B> {
    fn new(mut manager: AudioManager<B>) -> Self {
        let listener = manager
            .add_listener(Vec3::ZERO, glam::Quat::IDENTITY)
            .map_err(|e| tracing::warn!("Audio: failed to create listener: {e}"))
            .ok();
        Self {
            manager,
            listener,
            listener_position: Vec3::ZERO,
            buses: HashMap::new(),
            voices: HashMap::new(),
            retired: Vec::new(),
            skipped: HashSet::new(),
            next_epoch: 1,
            beat: None,
        }
    }

    fn render(&mut self, mixer: &Mixer, music: &AdaptiveMusicSequencer) {
        let graph = &mixer.graph;
        let now = graph.now();
        self.sync_listener(graph.listener());
        self.sync_buses(graph, &mixer.buses, now);
        let adopted = self.sync_voices(graph, &mixer.buses, music, now);
        self.sync_music(graph, music, now, adopted);
        self.retired
            .retain(|voice| voice.sound.state() != PlaybackState::Stopped);
    }

    fn sync_listener(&mut self, position: Vec3) {
        if position == self.listener_position {
            return;
        }
        self.listener_position = position;
        if let Some(listener) = &mut self.listener {
            listener.set_position(position, INSTANT);
        }
    }

    fn sync_buses(&mut self, graph: &AudioGraph, buses: &BusGraph, now: f64) {
        let Some(master) = buses.get(MASTER_BUS) else {
            return;
        };
        // Every other bus hangs off master, so a new master rebuilds them all
        let master_stale = self
            .buses
            .get(MASTER_BUS)
            .map_or(true, |tracks| tracks.effects != effect_signature(master));
        if master_stale {
            self.buses.clear();
        }
        self.buses.retain(|name, _| buses.contains(name));

        let ordered = std::iter::once(master).chain(buses.iter().filter(|b| !b.is_master()));
        for bus in ordered {
            let signature = effect_signature(bus);
            let current = self.buses.get(&bus.name).is_some_and(|t| t.effects == signature);
            if !current {
                self.buses.remove(&bus.name);
                if let Some(tracks) = self.build_bus(graph, bus, signature) {
                    self.buses.insert(bus.name.clone(), tracks);
                }
            }

            let Some(tracks) = self.buses.get_mut(&bus.name) else {
                continue;
            };
            if let Some(gain) = graph.gain_param(bus.input()).map(Pushed::of) {
                if gain.replace(&mut tracks.gain) {
                    tracks
                        .chain
                        .set_volume(amplitude_to_db(gain.value as f64), gain.tween(now));
                }
            }
            if let Some(duck) = graph.gain_param(bus.duck_node()).map(Pushed::of) {
                if duck.replace(&mut tracks.duck_level) {
                    tracks
                        .duck
                        .set_volume(amplitude_to_db(duck.value as f64), duck.tween(now));
                }
            }
        }
    }

    fn build_bus(
        &mut self,
        graph: &AudioGraph,
        bus: &Bus,
        effects: Vec<(EffectType, EffectParams)>,
    ) -> Option<BusTracks> {
        let duck = if bus.is_master() {
            self.manager.add_sub_track(TrackBuilder::new())
        } else {
            self.buses
                .get_mut(MASTER_BUS)?
                .chain
                .add_sub_track(TrackBuilder::new())
        };
        let mut duck = duck
            .map_err(|e| tracing::warn!("Audio: failed to create track for bus '{}': {e}", bus.name))
            .ok()?;

        let mut builder = TrackBuilder::new();
        for effect in bus.chain() {
            add_bus_effect(&mut builder, effect, graph);
        }
        let chain = duck
            .add_sub_track(builder)
            .map_err(|e| tracing::warn!("Audio: failed to create track for bus '{}': {e}", bus.name))
            .ok()?;

        let epoch = self.next_epoch;
        self.next_epoch += 1;
        tracing::debug!("Audio: built device tracks for bus '{}'", bus.name);
        Some(BusTracks {
            effects,
            epoch,
            chain,
            duck,
            gain: None,
            duck_level: None,
        })
    }

    fn epoch_of(&self, target: &Target) -> u64 {
        match target {
            Target::Main => 0,
            Target::Bus(name) => self.buses.get(name).map_or(0, |b| b.epoch),
        }
    }

    /// Start, move, update and stop sounds to match the playing sources.
    /// Returns whether stems queued for a quantized jump were taken over.
    fn sync_voices(
        &mut self,
        graph: &AudioGraph,
        buses: &BusGraph,
        music: &AdaptiveMusicSequencer,
        now: f64,
    ) -> bool {
        let bus_inputs: HashMap<NodeId, &str> =
            buses.iter().map(|b| (b.input(), b.name.as_str())).collect();
        let stems: HashMap<NodeId, &str> = music
            .stem_sources()
            .filter_map(|(name, _, source)| source.map(|s| (s, name)))
            .collect();
        let playing = graph.playing_sources();
        let live: HashSet<NodeId> = playing.iter().map(|(id, _)| *id).collect();

        let gone: Vec<NodeId> = self
            .voices
            .keys()
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in gone {
            if let Some(mut voice) = self.voices.remove(&id) {
                voice.stop();
                self.retired.push(voice);
            }
        }
        self.skipped.retain(|id| live.contains(id));

        let mut adopted = false;
        for (id, source) in playing {
            let Some(route) = Route::trace(graph, id, &bus_inputs) else {
                continue;
            };
            let epoch = self.epoch_of(&route.target);

            let existing = self.voices.get(&id).map(|v| (v.target == route.target, v.epoch == epoch));
            match existing {
                Some((true, true)) => {}
                Some(_) => {
                    // Bus changed or its tracks were rebuilt: carry on from where it is
                    let Some(mut old) = self.voices.remove(&id) else {
                        continue;
                    };
                    let position = old.sound.position();
                    old.stop();
                    self.retired.push(old);
                    self.start_voice(graph, id, source, &route, position, now);
                }
                None if self.skipped.contains(&id) => continue,
                None => {
                    let queued = stems
                        .get(&id)
                        .and_then(|name| self.take_queued(name, music, now));
                    match queued {
                        Some(voice) => {
                            self.voices.insert(id, voice);
                            adopted = true;
                        }
                        None => {
                            let position = source.position_at(now);
                            self.start_voice(graph, id, source, &route, position, now);
                        }
                    }
                }
            }

            if let Some(voice) = self.voices.get_mut(&id) {
                voice.sync(graph, &route, source, now);
            }
        }
        adopted
    }

    fn start_voice(
        &mut self,
        graph: &AudioGraph,
        id: NodeId,
        source: &SourceNode,
        route: &Route,
        position: f64,
        now: f64,
    ) {
        let placement = route.panner.and_then(|id| match graph.node(id) {
            Some(NodeKind::Panner(panner)) => Some(Placement {
                position: panner.position,
                ref_distance: panner.ref_distance,
                max_distance: panner.max_distance,
            }),
            _ => None,
        });
        let filter = route.filter.and_then(|id| match graph.node(id) {
            Some(NodeKind::Filter(filter)) => {
                Some((filter.frequency.value_at(now), filter.q.value_at(now)))
            }
            _ => None,
        });
        let plan = VoicePlan {
            buffer: &source.buffer,
            looping: source.looping,
            position,
            start_time: StartTime::Immediate,
            target: route.target.clone(),
            placement,
            volume: route.current_volume(graph, now),
            rate: source.playback_rate.value_at(now),
            filter,
        };

        match spawn_voice(&mut self.manager, &mut self.buses, self.listener.as_ref(), plan) {
            Ok(voice) => {
                self.voices.insert(id, voice);
            }
            Err(e) => {
                tracing::warn!("Audio: failed to start sound for source {id:?}: {e}");
                self.skipped.insert(id);
            }
        }
    }

    /// Hand over a stem queued for the jump that just executed
    fn take_queued(&mut self, stem: &str, music: &AdaptiveMusicSequencer, now: f64) -> Option<Voice> {
        let queued = self.beat.as_mut()?.queued.as_mut()?;
        if now < queued.at || music.current_segment() != Some(queued.segment.as_str()) {
            return None;
        }
        queued.voices.remove(stem)
    }

    fn sync_music(
        &mut self,
        graph: &AudioGraph,
        music: &AdaptiveMusicSequencer,
        now: f64,
        adopted: bool,
    ) {
        let mut beat = match self.beat.take() {
            Some(beat) => beat,
            None if music.is_playing() => {
                let speed = ClockSpeed::TicksPerMinute(music.bpm() as f64);
                match self.manager.add_clock(speed) {
                    Ok(clock) => BeatClock {
                        clock,
                        bpm: music.bpm(),
                        running: false,
                        anchor: music.reference_start(),
                        queued: None,
                    },
                    Err(e) => {
                        tracing::warn!("Audio: failed to create music clock: {e}");
                        return;
                    }
                }
            }
            None => return,
        };

        // Drop a queued jump the sequencer no longer plans (executed,
        // superseded or cancelled) and lift the hold on the old stems
        if let Some(queued) = beat.queued.take() {
            let planned = music
                .pending_seek()
                .is_some_and(|(at, segment)| at == queued.at && segment.name == queued.segment);
            if planned {
                beat.queued = Some(queued);
            } else {
                for (_, mut voice) in queued.voices {
                    voice.stop();
                    self.retired.push(voice);
                }
                for voice in self.voices.values_mut().filter(|v| v.held) {
                    voice.held = false;
                    voice.volume = None;
                }
            }
        }

        if music.is_playing() {
            if beat.bpm != music.bpm() {
                beat.bpm = music.bpm();
                beat.clock
                    .set_speed(ClockSpeed::TicksPerMinute(beat.bpm as f64), INSTANT);
            }

            let anchor = music.reference_start();
            if !beat.running {
                beat.clock.start();
                beat.running = true;
                beat.anchor = anchor;
            } else if anchor != beat.anchor {
                // An on-beat jump keeps the grid, an immediate one restarts it
                if !adopted {
                    beat.clock.stop();
                    beat.clock.start();
                }
                beat.anchor = anchor;
            }

            if beat.queued.is_none() {
                if let Some((at, segment)) = music.pending_seek() {
                    beat.queued = Some(self.queue_seek(graph, music, &beat, at, segment, now));
                }
            }
        } else if beat.running {
            beat.clock.stop();
            beat.running = false;
        }

        self.beat = Some(beat);
    }

    /// Pre-start the stems for a quantized jump on the tick it lands on, and
    /// silence the outgoing stems on that same tick
    fn queue_seek(
        &mut self,
        graph: &AudioGraph,
        music: &AdaptiveMusicSequencer,
        beat: &BeatClock,
        at: f64,
        segment: &MusicSegment,
        now: f64,
    ) -> QueuedSeek {
        let beat_length = 60.0 / beat.bpm.max(f32::EPSILON) as f64;
        let ticks = ((at - now) / beat_length).ceil().max(1.0) as u64;
        let start_time = StartTime::ClockTime(beat.clock.time() + ticks);

        let mut voices = HashMap::new();
        for (name, buffer, _) in music.stem_sources() {
            let volume = music
                .stem_gain(name)
                .and_then(|gain| graph.gain_param(gain))
                .map_or(0.0, |param| param.value_at(at));
            let duration = buffer.duration();
            let plan = VoicePlan {
                buffer,
                looping: true,
                position: if duration > 0.0 {
                    segment.start_time % duration
                } else {
                    0.0
                },
                start_time,
                target: Target::Main,
                placement: None,
                volume,
                rate: 1.0,
                filter: None,
            };
            match spawn_voice(&mut self.manager, &mut self.buses, self.listener.as_ref(), plan) {
                Ok(voice) => {
                    voices.insert(name.to_string(), voice);
                }
                Err(e) => tracing::warn!("Audio: failed to queue stem '{name}': {e}"),
            }
        }

        let silence_on_tick = Tween {
            start_time,
            ..INSTANT
        };
        for (_, _, source) in music.stem_sources() {
            if let Some(voice) = source.and_then(|s| self.voices.get_mut(&s)) {
                voice.sound.set_volume(amplitude_to_db(0.0), silence_on_tick);
                voice.held = true;
            }
        }

        tracing::debug!(
            "Audio: queued {} stems for segment '{}'",
            voices.len(),
            segment.name
        );
        QueuedSeek {
            at,
            segment: segment.name.clone(),
            voices,
        }
    }
}

/// The device side of the engine. Inert when no device could be opened.
pub struct AudioOutput<B: Backend = DefaultBackend> {
    device: Option<Device<B>>,
}

impl AudioOutput<DefaultBackend> {
    /// Open the default device, running silent when there is none
    pub fn open(config: &OutputConfig) -> Self {
        if !config.enabled {
            tracing::info!("Audio: output disabled, running silent");
            return Self::silent();
        }
        let settings = AudioManagerSettings {
            capacities: Capacities {
                sub_track_capacity: config.max_tracks,
                ..Default::default()
            },
            ..Default::default()
        };
        let device = AudioManager::<DefaultBackend>::new(settings)
            .map_err(|e| tracing::warn!("Audio: no device available ({e}), running silent"))
            .ok()
            .map(Device::new);
        Self { device }
    }
}

impl<B: Backend> AudioOutput<B> {
    pub fn silent() -> Self {
        Self { device: None }
    }

    /// Render through an already opened manager
    pub fn with_manager(manager: AudioManager<B>) -> Self {
        Self {
            device: Some(Device::new(manager)),
        }
    }

    pub fn is_available(&self) -> bool {
        self.device.is_some()
    }

    /// Bring the device in line with the mixer and the music sequencer
    pub fn render(&mut self, mixer: &Mixer, music: &AdaptiveMusicSequencer) {
        if let Some(device) = &mut self.device {
            device.render(mixer, music);
        }
    }

    /// Sounds currently started on the device
    pub fn voice_count(&self) -> usize {
        self.device.as_ref().map_or(0, |d| d.voices.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;
    use crate::effect::EffectDef;
    use crate::instance::tests::{fixture, params, Fixture, E1};
    use crate::instance::{InstanceKey, InstanceParams, SpatialParams};
    use kira::backend::mock::MockBackend;
    use std::sync::Arc;

    fn mock_output() -> AudioOutput<MockBackend> {
        AudioOutput::with_manager(AudioManager::<MockBackend>::new(AudioManagerSettings::default()).unwrap())
    }

    fn device(output: &AudioOutput<MockBackend>) -> &Device<MockBackend> {
        output.device.as_ref().unwrap()
    }

    fn music() -> AdaptiveMusicSequencer {
        AdaptiveMusicSequencer::new(&AudioConfig::default())
    }

    fn playing(f: &mut Fixture, bus: &str) -> InstanceKey {
        let key = f.create(E1, "", bus);
        assert!(f.sounds.play(&mut f.mixer, &key));
        key
    }

    fn source_of(f: &Fixture, key: &InstanceKey) -> NodeId {
        f.sounds.get(key).unwrap().source_node().unwrap()
    }

    #[test]
    fn test_amplitude_to_db() {
        assert_eq!(amplitude_to_db(0.0), Decibels(-60.0));
        assert_eq!(amplitude_to_db(1.0), Decibels(0.0));
        assert!((amplitude_to_db(0.5).0 + 6.0206).abs() < 1e-3);
        assert_eq!(amplitude_to_db(1e-9), Decibels(-60.0));
    }

    #[test]
    fn test_resonance_from_q() {
        assert_eq!(resonance(0.5), 0.0);
        assert!((resonance(1.0) - 0.5).abs() < 1e-9);
        assert_eq!(resonance(1000.0), 0.99);
    }

    #[test]
    fn test_pushed_tween_covers_remaining_ramp() {
        let mut param = AudioParam::new(1.0);
        param.ramp_to(0.0, 2.0, 0.5);
        let pushed = Pushed::of(&param);
        assert_eq!(pushed.value, 0.0);
        assert_eq!(pushed.tween(2.25).duration, Duration::from_secs_f64(0.25));
        assert_eq!(pushed.tween(3.0).duration, PARAM_TWEEN.duration);

        let mut slot = None;
        assert!(pushed.replace(&mut slot));
        assert!(!pushed.replace(&mut slot));
    }

    #[test]
    fn test_route_follows_instance_chain() {
        let mut f = fixture();
        f.sounds.set_occlusion(&mut f.mixer, E1, true);
        let spatial = InstanceParams {
            spatial: Some(SpatialParams::at(Vec3::new(3.0, 0.0, 0.0))),
            ..params("ambient")
        };
        assert!(f
            .sounds
            .create_instance(&mut f.mixer, &f.cache, E1, "loop", &spatial, ""));
        let key = InstanceKey::primary(E1);
        f.sounds.play(&mut f.mixer, &key);

        let instance = f.sounds.get(&key).unwrap();
        let bus_inputs: HashMap<NodeId, &str> = f
            .mixer
            .buses
            .iter()
            .map(|b| (b.input(), b.name.as_str()))
            .collect();
        let route = Route::trace(&f.mixer.graph, source_of(&f, &key), &bus_inputs).unwrap();
        assert_eq!(route.target, Target::Bus("ambient".into()));
        assert_eq!(route.gains, vec![instance.gain_node()]);
        assert_eq!(route.panner, instance.panner_node());
        assert_eq!(route.filter, instance.occlusion_node());
    }

    #[test]
    fn test_route_volume_multiplies_gains() {
        let mut f = fixture();
        let key = playing(&mut f, "sfx");
        f.sounds.set_volume(&mut f.mixer, &key, 0.5);

        f.mixer.buses.set_bus_volume(&mut f.mixer.graph, "sfx", 0.5);

        // With no bus inputs the trace runs on through the bus stages to the destination
        let route = Route::trace(&f.mixer.graph, source_of(&f, &key), &HashMap::new()).unwrap();
        assert_eq!(route.target, Target::Main);
        let volume = route.volume(&f.mixer.graph);
        assert!((volume.value - 0.25).abs() < 1e-6);
        assert!(volume.end > f.mixer.now());
    }

    #[test]
    fn test_unplugged_source_has_no_route() {
        let mut f = fixture();
        let buffer = Arc::new(AudioBuffer::silent(1_000, 1.0));
        let source = f.mixer.graph.create_source(buffer, false, 1.0);
        assert!(Route::trace(&f.mixer.graph, source, &HashMap::new()).is_none());
    }

    #[test]
    fn test_silent_output_is_inert() {
        let mut f = fixture();
        playing(&mut f, "sfx");
        let mut output = AudioOutput::<MockBackend>::silent();
        output.render(&f.mixer, &music());
        assert!(!output.is_available());
        assert_eq!(output.voice_count(), 0);
    }

    #[test]
    fn test_every_bus_gets_tracks() {
        let f = fixture();
        let mut output = mock_output();
        output.render(&f.mixer, &music());

        let d = device(&output);
        assert_eq!(d.buses.len(), f.mixer.buses.len());
        for name in f.mixer.buses.names() {
            assert!(d.buses.contains_key(name), "missing tracks for '{name}'");
        }
        assert!(d.buses.values().all(|t| t.gain.is_some() && t.duck_level.is_some()));
    }

    #[test]
    fn test_deleted_bus_drops_tracks() {
        let mut f = fixture();
        let mut output = mock_output();
        output.render(&f.mixer, &music());
        assert!(f.mixer.buses.delete_bus(&mut f.mixer.graph, "ambient"));
        output.render(&f.mixer, &music());
        assert!(!device(&output).buses.contains_key("ambient"));
    }

    #[test]
    fn test_bus_volume_pushed_once() {
        let mut f = fixture();
        let mut output = mock_output();
        output.render(&f.mixer, &music());
        f.mixer.buses.set_bus_volume(&mut f.mixer.graph, "sfx", 0.25);
        output.render(&f.mixer, &music());

        let pushed = device(&output).buses["sfx"].gain.unwrap();
        assert_eq!(pushed.value, 0.25);
        output.render(&f.mixer, &music());
        assert_eq!(device(&output).buses["sfx"].gain, Some(pushed));
    }

    #[test]
    fn test_playing_instance_gets_voice_on_its_bus() {
        let mut f = fixture();
        let key = playing(&mut f, "sfx");
        let mut output = mock_output();
        output.render(&f.mixer, &music());

        assert_eq!(output.voice_count(), 1);
        let voice = &device(&output).voices[&source_of(&f, &key)];
        assert_eq!(voice.target, Target::Bus("sfx".into()));
        assert_eq!(voice.epoch, device(&output).buses["sfx"].epoch);
        assert_eq!(voice.filtered, Some(false));

        f.sounds.stop(&mut f.mixer, &key);
        output.render(&f.mixer, &music());
        assert_eq!(output.voice_count(), 0);
        assert_eq!(device(&output).retired.len(), 1);
    }

    #[test]
    fn test_occluded_voice_engages_filter() {
        let mut f = fixture();
        f.sounds.set_occlusion(&mut f.mixer, E1, true);
        let key = playing(&mut f, "sfx");
        let mut output = mock_output();
        output.render(&f.mixer, &music());

        let voice = &device(&output).voices[&source_of(&f, &key)];
        assert_eq!(voice.filtered, Some(true));
        assert!(voice.cutoff.is_some());
    }

    #[test]
    fn test_bus_effect_change_rehomes_voice() {
        let mut f = fixture();
        let key = playing(&mut f, "sfx");
        let mut output = mock_output();
        output.render(&f.mixer, &music());
        let before = device(&output).buses["sfx"].epoch;

        f.mixer
            .buses
            .set_bus_effects(&mut f.mixer.graph, "sfx", &[EffectDef::new("lowpass")]);
        output.render(&f.mixer, &music());

        let d = device(&output);
        let after = d.buses["sfx"].epoch;
        assert_ne!(before, after);
        assert_eq!(d.voices[&source_of(&f, &key)].epoch, after);
        assert_eq!(d.retired.len(), 1);
    }

    #[test]
    fn test_master_effect_change_rebuilds_every_bus() {
        let mut f = fixture();
        let mut output = mock_output();
        output.render(&f.mixer, &music());
        let before: HashMap<String, u64> = device(&output)
            .buses
            .iter()
            .map(|(name, t)| (name.clone(), t.epoch))
            .collect();

        f.mixer
            .buses
            .set_bus_effects(&mut f.mixer.graph, MASTER_BUS, &[EffectDef::new("compressor")]);
        output.render(&f.mixer, &music());
        for (name, tracks) in &device(&output).buses {
            assert_ne!(before[name], tracks.epoch, "bus '{name}' kept stale tracks");
        }
    }

    #[test]
    fn test_moved_instance_follows_bus() {
        let mut f = fixture();
        let key = playing(&mut f, "sfx");
        let mut output = mock_output();
        output.render(&f.mixer, &music());

        f.sounds.set_bus(&mut f.mixer, &key, "ambient");
        output.render(&f.mixer, &music());
        let voice = &device(&output).voices[&source_of(&f, &key)];
        assert_eq!(voice.target, Target::Bus("ambient".into()));
    }

    fn four_stems() -> Vec<(String, Arc<AudioBuffer>)> {
        ["pad", "bass", "melody", "drums"]
            .iter()
            .map(|name| (name.to_string(), Arc::new(AudioBuffer::silent(1_000, 64.0))))
            .collect()
    }

    fn stem_source_ids(music: &AdaptiveMusicSequencer) -> HashSet<NodeId> {
        music.stem_sources().filter_map(|(_, _, source)| source).collect()
    }

    #[test]
    fn test_music_runs_beat_clock() {
        let mut f = fixture();
        let mut music = music();
        music.load_stem_set(&mut f.mixer.graph, four_stems());
        let mut output = mock_output();

        output.render(&f.mixer, &music);
        assert!(device(&output).beat.is_none());

        music.play(&mut f.mixer.graph);
        output.render(&f.mixer, &music);
        assert_eq!(output.voice_count(), 4);
        assert!(device(&output).beat.as_ref().unwrap().running);

        music.stop(&mut f.mixer.graph);
        output.render(&f.mixer, &music);
        assert_eq!(output.voice_count(), 0);
        assert!(!device(&output).beat.as_ref().unwrap().running);
    }

    #[test]
    fn test_quantized_jump_adopts_queued_stems() {
        let mut f = fixture();
        let mut music = music();
        music.load_stem_set(&mut f.mixer.graph, four_stems());
        music.set_segments(vec![
            MusicSegment::new("intro", 0.0, 8.0),
            MusicSegment::new("main", 8.0, 32.0),
        ]);
        music.play(&mut f.mixer.graph);
        let mut output = mock_output();
        output.render(&f.mixer, &music);

        f.clock.set(0.2);
        assert!(music.transition_to_segment(&mut f.mixer.graph, "main", true));
        output.render(&f.mixer, &music);
        {
            let d = device(&output);
            let queued = d.beat.as_ref().unwrap().queued.as_ref().unwrap();
            assert_eq!(queued.segment, "main");
            assert_eq!(queued.voices.len(), 4);
            assert!(d.voices.values().all(|v| v.held));
        }

        f.clock.set(0.5);
        music.update(&mut f.mixer.graph);
        output.render(&f.mixer, &music);

        let d = device(&output);
        assert!(d.beat.as_ref().unwrap().queued.is_none());
        let keys: HashSet<NodeId> = d.voices.keys().copied().collect();
        assert_eq!(keys, stem_source_ids(&music));
        assert!(d.voices.values().all(|v| !v.held));
        // Only the outgoing stems were stopped
        assert_eq!(d.retired.len(), 4);
    }

    #[test]
    fn test_immediate_jump_cancels_queued_stems() {
        let mut f = fixture();
        let mut music = music();
        music.load_stem_set(&mut f.mixer.graph, four_stems());
        music.set_segments(vec![
            MusicSegment::new("intro", 0.0, 8.0),
            MusicSegment::new("main", 8.0, 32.0),
            MusicSegment::new("outro", 40.0, 4.0),
        ]);
        music.play(&mut f.mixer.graph);
        let mut output = mock_output();
        output.render(&f.mixer, &music);

        f.clock.set(0.2);
        music.transition_to_segment(&mut f.mixer.graph, "main", true);
        output.render(&f.mixer, &music);

        music.transition_to_segment(&mut f.mixer.graph, "outro", false);
        output.render(&f.mixer, &music);

        let d = device(&output);
        assert!(d.beat.as_ref().unwrap().queued.is_none());
        let keys: HashSet<NodeId> = d.voices.keys().copied().collect();
        assert_eq!(keys, stem_source_ids(&music));
        assert!(d.voices.values().all(|v| !v.held && v.volume.is_some()));
        // Four queued stems plus the four replaced ones
        assert_eq!(d.retired.len(), 8);
    }
}
