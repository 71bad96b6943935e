//! Node kinds that make up the signal graph

use super::param::AudioParam;
use crate::buffer::AudioBuffer;
use kira::Frame;
use sonance_core::Vec3;
use std::sync::Arc;

/// Identifier of a node in an [`AudioGraph`](super::AudioGraph)
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// The output device. Always present, never removed.
    pub const DESTINATION: NodeId = NodeId(0);
}

/// Playback lifecycle of a buffer source. Sources are single-use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Playing,
    Stopped,
}

/// Plays a decoded buffer once (or looped) from an offset
#[derive(Debug, Clone)]
pub struct SourceNode {
    pub buffer: Arc<AudioBuffer>,
    pub looping: bool,
    pub playback_rate: AudioParam,
    pub state: SourceState,
    /// Clock time at which `start` was called
    pub started_at: f64,
    /// Offset into the buffer playback started from, in seconds
    pub offset: f64,
}

impl SourceNode {
    /// Whether a non-looping source has run off the end of its buffer by `now`
    pub fn has_finished(&self, now: f64) -> bool {
        if self.state != SourceState::Playing || self.looping {
            return false;
        }
        let rate = self.playback_rate.value_at(now).max(f32::EPSILON) as f64;
        let remaining = (self.buffer.duration() - self.offset).max(0.0) / rate;
        now >= self.started_at + remaining
    }

    /// Playhead in buffer seconds at `now`, wrapped for looping sources
    pub fn position_at(&self, now: f64) -> f64 {
        if self.state != SourceState::Playing {
            return self.offset;
        }
        let rate = self.playback_rate.value_at(now).max(0.0) as f64;
        let position = self.offset + (now - self.started_at).max(0.0) * rate;
        let duration = self.buffer.duration();
        if self.looping && duration > 0.0 {
            position % duration
        } else {
            position.min(duration)
        }
    }
}

/// Distance-attenuated positional node (inverse distance model)
#[derive(Debug, Clone)]
pub struct PannerNode {
    pub position: Vec3,
    pub ref_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
}

impl PannerNode {
    /// Attenuation for a listener at `listener`.
    ///
    /// Distance is clamped to `[ref_distance, max_distance]` before applying
    /// `ref / (ref + rolloff * (d - ref))`.
    pub fn distance_gain(&self, listener: Vec3) -> f32 {
        let reference = self.ref_distance.max(f32::EPSILON);
        let max = self.max_distance.max(reference);
        let distance = self.position.distance(listener).clamp(reference, max);
        reference / (reference + self.rolloff_factor.max(0.0) * (distance - reference))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    Lowpass,
    Highpass,
}

/// Resonant biquad filter
#[derive(Debug, Clone)]
pub struct FilterNode {
    pub kind: FilterKind,
    pub frequency: AudioParam,
    pub q: AudioParam,
}

/// Procedurally generated stereo impulse response
#[derive(Debug, Clone)]
pub struct ImpulseResponse {
    pub sample_rate: u32,
    pub frames: Vec<Frame>,
}

impl ImpulseResponse {
    pub fn duration(&self) -> f64 {
        self.frames.len() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Dynamics compressor settings (dB / ratio / seconds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorNode {
    pub threshold: f32,
    pub knee: f32,
    pub ratio: f32,
    pub attack: f32,
    pub release: f32,
}

/// The processing performed by a node
#[derive(Debug, Clone)]
pub enum NodeKind {
    Gain { gain: AudioParam },
    Source(SourceNode),
    Panner(PannerNode),
    Filter(FilterNode),
    Convolver { impulse: Arc<ImpulseResponse> },
    Compressor(CompressorNode),
    Delay { delay_time: AudioParam, max_delay: f32 },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Gain { .. } => "gain",
            NodeKind::Source(_) => "source",
            NodeKind::Panner(_) => "panner",
            NodeKind::Filter(_) => "filter",
            NodeKind::Convolver { .. } => "convolver",
            NodeKind::Compressor(_) => "compressor",
            NodeKind::Delay { .. } => "delay",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panner_at(x: f32) -> PannerNode {
        PannerNode {
            position: Vec3::new(x, 0.0, 0.0),
            ref_distance: 1.0,
            max_distance: 25.0,
            rolloff_factor: 1.0,
        }
    }

    #[test]
    fn test_inverse_distance_gain() {
        assert!((panner_at(0.5).distance_gain(Vec3::ZERO) - 1.0).abs() < 1e-6);
        assert!((panner_at(2.0).distance_gain(Vec3::ZERO) - 0.5).abs() < 1e-6);
        assert!((panner_at(4.0).distance_gain(Vec3::ZERO) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_distance_clamped_to_max() {
        let far = panner_at(1000.0).distance_gain(Vec3::ZERO);
        let max = panner_at(25.0).distance_gain(Vec3::ZERO);
        assert!((far - max).abs() < 1e-6);
    }

    #[test]
    fn test_source_finishes_after_buffer_length() {
        let mut source = SourceNode {
            buffer: Arc::new(AudioBuffer::silent(1000, 2.0)),
            looping: false,
            playback_rate: AudioParam::new(2.0),
            state: SourceState::Playing,
            started_at: 10.0,
            offset: 0.5,
        };
        // 1.5s of buffer left at double speed
        assert!(!source.has_finished(10.7));
        assert!(source.has_finished(10.75));

        source.looping = true;
        assert!(!source.has_finished(100.0));
    }

    #[test]
    fn test_position_wraps_when_looping() {
        let mut source = SourceNode {
            buffer: Arc::new(AudioBuffer::silent(1000, 2.0)),
            looping: true,
            playback_rate: AudioParam::new(1.0),
            state: SourceState::Playing,
            started_at: 10.0,
            offset: 1.5,
        };
        assert!((source.position_at(11.0) - 0.5).abs() < 1e-9);

        source.looping = false;
        assert!((source.position_at(11.0) - 2.0).abs() < 1e-9);

        source.state = SourceState::Idle;
        assert!((source.position_at(11.0) - 1.5).abs() < 1e-9);
    }
}
