//! Adaptive music: phase-locked stems, intensity tiers and segment jumps
//!
//! Stems loop together from a shared reference start time. Intensity maps
//! to which stems are audible; segments are named offsets into the stem
//! timeline that playback can jump to, optionally waiting for the next beat.
//!
//! Deferred work (quantized seeks, on-beat remixes) is queued with its due
//! time and executed from [`AdaptiveMusicSequencer::update`].

use crate::buffer::AudioBuffer;
use crate::config::AudioConfig;
use crate::graph::{AudioGraph, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Intensity at which each conventional stem becomes audible. `pad` is the
/// exception: it plays at any intensity above zero.
const STEM_TIERS: [(&str, f32); 4] = [("pad", 0.0), ("bass", 0.25), ("melody", 0.5), ("drums", 0.75)];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Loaded,
    Playing,
    /// Playing with a quantized seek waiting for its beat
    Transitioning,
}

/// A named region of the stem timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MusicSegment {
    pub name: String,
    pub start_time: f64,
    pub duration: f64,
}

impl MusicSegment {
    pub fn new(name: &str, start_time: f64, duration: f64) -> Self {
        Self {
            name: name.to_string(),
            start_time,
            duration,
        }
    }
}

struct Stem {
    name: String,
    buffer: Arc<AudioBuffer>,
    gain: NodeId,
    source: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
enum MusicEvent {
    Seek(MusicSegment),
    Remix { ramp: f64 },
}

#[derive(Debug, Clone)]
struct Scheduled {
    at: f64,
    event: MusicEvent,
}

pub struct AdaptiveMusicSequencer {
    stems: Vec<Stem>,
    segments: Vec<MusicSegment>,
    current_segment: Option<String>,
    intensity: f32,
    bpm: f32,
    state: SequencerState,
    /// Clock time the stem timeline would have started at from offset 0
    reference_start: f64,
    /// Offset the next `play` starts from
    start_offset: f64,
    pending: Vec<Scheduled>,
    intensity_ramp: f64,
}

impl AdaptiveMusicSequencer {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            stems: Vec::new(),
            segments: Vec::new(),
            current_segment: None,
            intensity: 0.0,
            bpm: config.default_bpm,
            state: SequencerState::Idle,
            reference_start: 0.0,
            start_offset: 0.0,
            pending: Vec::new(),
            intensity_ramp: config.intensity_ramp(),
        }
    }

    /// Replace the current stem set. Every stem starts muted and is wired
    /// straight to the output.
    pub fn load_stem_set<I>(&mut self, graph: &mut AudioGraph, stems: I)
    where
        I: IntoIterator<Item = (String, Arc<AudioBuffer>)>,
    {
        self.stop(graph);
        for stem in self.stems.drain(..) {
            graph.remove_node(stem.gain);
        }

        for (name, buffer) in stems {
            if let Some(existing) = self.stems.iter_mut().find(|s| s.name == name) {
                existing.buffer = buffer;
                continue;
            }
            let gain = graph.create_gain(0.0);
            let _ = graph.connect(gain, NodeId::DESTINATION);
            self.stems.push(Stem {
                name,
                buffer,
                gain,
                source: None,
            });
        }

        self.state = if self.stems.is_empty() {
            SequencerState::Idle
        } else {
            SequencerState::Loaded
        };
        tracing::debug!("Audio: loaded {} music stems", self.stems.len());
    }

    /// Store the intensity and ramp each tiered stem towards audible or
    /// muted over the intensity ramp
    pub fn set_intensity(&mut self, graph: &mut AudioGraph, level: f32) {
        self.intensity = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
        self.apply_intensity(graph, self.intensity_ramp);
    }

    pub fn set_bpm(&mut self, bpm: f32) {
        if bpm.is_nan() || bpm <= 0.0 {
            tracing::warn!("Audio: ignoring invalid bpm {bpm}");
            return;
        }
        self.bpm = bpm;
    }

    /// Start every stem from the same instant. No-op if already playing.
    pub fn play(&mut self, graph: &mut AudioGraph) -> bool {
        match self.state {
            SequencerState::Playing | SequencerState::Transitioning => return false,
            SequencerState::Idle => {
                tracing::warn!("Audio: music play requested with no stems loaded");
                return false;
            }
            SequencerState::Loaded => {}
        }

        let now = graph.now();
        self.reference_start = now - self.start_offset;
        self.start_sources(graph, self.start_offset);
        self.state = SequencerState::Playing;
        self.apply_intensity(graph, self.intensity_ramp);
        true
    }

    /// Stop and drop every stem source. Gain nodes stay for the next play,
    /// which restarts the current segment from its beginning.
    pub fn stop(&mut self, graph: &mut AudioGraph) {
        self.release_sources(graph);
        self.pending.clear();
        self.start_offset = self.current_segment_start();
        if self.state != SequencerState::Idle {
            self.state = SequencerState::Loaded;
        }
    }

    /// Replace the segment list. The first segment becomes current if the
    /// current one no longer exists.
    pub fn set_segments(&mut self, segments: Vec<MusicSegment>) {
        self.segments = segments;
        let still_valid = self
            .current_segment
            .as_deref()
            .is_some_and(|name| self.segments.iter().any(|s| s.name == name));
        if !still_valid {
            self.current_segment = self.segments.first().map(|s| s.name.clone());
            if !self.is_playing() {
                self.start_offset = self.current_segment_start();
            }
        }
    }

    /// Jump to a named segment, on the next beat when `quantized` and playing.
    ///
    /// A quantized request replaces any seek still waiting for its beat.
    pub fn transition_to_segment(&mut self, graph: &mut AudioGraph, name: &str, quantized: bool) -> bool {
        let Some(segment) = self.segments.iter().find(|s| s.name == name).cloned() else {
            tracing::warn!("Audio: unknown music segment '{name}'");
            return false;
        };

        self.pending.retain(|p| !matches!(p.event, MusicEvent::Seek(_)));

        if !quantized || !self.is_playing() {
            self.seek(graph, &segment);
            return true;
        }

        let at = self.next_beat_time(graph.now());
        tracing::debug!("Audio: segment '{name}' scheduled at {at:.3}");
        self.pending.push(Scheduled {
            at,
            event: MusicEvent::Seek(segment),
        });
        self.state = SequencerState::Transitioning;
        true
    }

    /// Re-apply the current intensity on the next beat, ramping over
    /// `duration`
    pub fn crossfade(&mut self, graph: &mut AudioGraph, duration: Duration) {
        let ramp = duration.as_secs_f64();
        if !self.is_playing() {
            self.apply_intensity(graph, ramp);
            return;
        }
        self.pending.push(Scheduled {
            at: self.next_beat_time(graph.now()),
            event: MusicEvent::Remix { ramp },
        });
    }

    /// Clock time of the first beat boundary strictly after `now`
    pub fn next_beat_time(&self, now: f64) -> f64 {
        let beat = 60.0 / self.bpm as f64;
        let elapsed = now - self.reference_start;
        let beat_index = (elapsed / beat).floor();
        self.reference_start + (beat_index + 1.0) * beat
    }

    /// Seconds from `now` until the next beat boundary of the stem timeline
    pub fn next_beat_delay(&self, now: f64) -> f64 {
        (self.next_beat_time(now) - now).max(0.0)
    }

    /// Run scheduled events that are due, in time order
    pub fn update(&mut self, graph: &mut AudioGraph) {
        if self.pending.is_empty() {
            return;
        }
        let now = graph.now();
        let (mut due, waiting): (Vec<Scheduled>, Vec<Scheduled>) =
            std::mem::take(&mut self.pending).into_iter().partition(|p| p.at <= now);
        self.pending = waiting;
        due.sort_by(|a, b| a.at.total_cmp(&b.at));

        for scheduled in due {
            match scheduled.event {
                MusicEvent::Seek(segment) => self.seek(graph, &segment),
                MusicEvent::Remix { ramp } => self.apply_intensity(graph, ramp),
            }
        }
    }

    // --- Queries ---

    pub fn current_segment(&self) -> Option<&str> {
        self.current_segment.as_deref()
    }

    pub fn segments(&self) -> &[MusicSegment] {
        &self.segments
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.state, SequencerState::Playing | SequencerState::Transitioning)
    }

    pub fn intensity(&self) -> f32 {
        self.intensity
    }

    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    pub fn stem_names(&self) -> Vec<&str> {
        self.stems.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn stem_gain(&self, name: &str) -> Option<NodeId> {
        self.stem(name).map(|s| s.gain)
    }

    pub fn is_stem_playing(&self, graph: &AudioGraph, name: &str) -> bool {
        self.stem(name)
            .and_then(|s| s.source)
            .is_some_and(|source| graph.is_source_playing(source))
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending.len()
    }

    /// Due time and target of the quantized seek waiting for its beat
    pub fn pending_seek(&self) -> Option<(f64, &MusicSegment)> {
        self.pending.iter().find_map(|p| match &p.event {
            MusicEvent::Seek(segment) => Some((p.at, segment)),
            MusicEvent::Remix { .. } => None,
        })
    }

    /// Clock time the stem timeline would have started at from offset 0
    pub fn reference_start(&self) -> f64 {
        self.reference_start
    }

    /// Name, buffer and live source of every stem
    pub(crate) fn stem_sources(&self) -> impl Iterator<Item = (&str, &Arc<AudioBuffer>, Option<NodeId>)> {
        self.stems
            .iter()
            .map(|s| (s.name.as_str(), &s.buffer, s.source))
    }

    fn current_segment_start(&self) -> f64 {
        self.current_segment
            .as_deref()
            .and_then(|name| self.segments.iter().find(|s| s.name == name))
            .map_or(0.0, |s| s.start_time)
    }

    fn stem(&self, name: &str) -> Option<&Stem> {
        self.stems.iter().find(|s| s.name == name)
    }

    fn apply_intensity(&self, graph: &mut AudioGraph, ramp: f64) {
        for (name, threshold) in STEM_TIERS {
            let Some(stem) = self.stem(name) else {
                continue;
            };
            let audible = if name == "pad" {
                self.intensity > threshold
            } else {
                self.intensity >= threshold
            };
            graph.ramp_gain(stem.gain, if audible { 1.0 } else { 0.0 }, ramp);
        }
    }

    /// Move the stem timeline to `segment`. While stopped only the offset
    /// for the next play is stored.
    fn seek(&mut self, graph: &mut AudioGraph, segment: &MusicSegment) {
        self.current_segment = Some(segment.name.clone());
        if !self.is_playing() {
            self.start_offset = segment.start_time;
            return;
        }

        self.release_sources(graph);
        self.reference_start = graph.now() - segment.start_time;
        self.start_sources(graph, segment.start_time);
        self.state = SequencerState::Playing;
        tracing::debug!("Audio: music jumped to segment '{}'", segment.name);
    }

    fn start_sources(&mut self, graph: &mut AudioGraph, offset: f64) {
        for stem in &mut self.stems {
            let source = graph.create_source(stem.buffer.clone(), true, 1.0);
            let _ = graph.connect(source, stem.gain);
            let _ = graph.start_source(source, offset);
            stem.source = Some(source);
        }
    }

    fn release_sources(&mut self, graph: &mut AudioGraph) {
        for stem in &mut self.stems {
            if let Some(source) = stem.source.take() {
                let _ = graph.stop_source(source);
                graph.remove_node(source);
            }
        }
    }
}
