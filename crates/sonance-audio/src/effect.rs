//! Effect factory: builds the node clusters that make up a bus effect chain
//!
//! Every effect, whatever its internal topology, exposes exactly one input
//! and one output node so a bus can chain them uniformly. Reverb impulse
//! responses are synthesized (decaying stereo noise) once per preset and
//! shared between every reverb that uses it.

use crate::graph::{
    AudioGraph, AudioParam, CompressorNode, FilterKind, ImpulseResponse, NodeId, NodeKind,
};
use kira::Frame;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Named numeric effect parameters
pub type EffectParams = BTreeMap<String, f32>;

/// Longest delay line a delay effect may allocate, in seconds
pub const MAX_DELAY_SECONDS: f32 = 2.0;

/// Feedback ceiling that keeps the delay loop from running away
pub const MAX_FEEDBACK: f32 = 0.95;

/// Effect definition as pushed by the authoring layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectDef {
    pub effect_type: String,
    #[serde(default)]
    pub params: EffectParams,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl EffectDef {
    pub fn new(effect_type: &str) -> Self {
        Self {
            effect_type: effect_type.to_string(),
            params: EffectParams::new(),
            enabled: true,
        }
    }

    pub fn with_param(mut self, name: &str, value: f32) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Recognised effect kinds. Anything else becomes a unity passthrough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectType {
    Reverb,
    Lowpass,
    Highpass,
    Compressor,
    Delay,
    Passthrough(String),
}

impl EffectType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "reverb" => EffectType::Reverb,
            "lowpass" => EffectType::Lowpass,
            "highpass" => EffectType::Highpass,
            "compressor" => EffectType::Compressor,
            "delay" => EffectType::Delay,
            other => EffectType::Passthrough(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            EffectType::Reverb => "reverb",
            EffectType::Lowpass => "lowpass",
            EffectType::Highpass => "highpass",
            EffectType::Compressor => "compressor",
            EffectType::Delay => "delay",
            EffectType::Passthrough(tag) => tag,
        }
    }
}

/// Duration and density of a canned reverb space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReverbPreset {
    pub name: &'static str,
    pub duration: f32,
    pub density: f32,
}

/// Indexed by the reverb `preset` parameter
pub const REVERB_PRESETS: [ReverbPreset; 4] = [
    ReverbPreset { name: "hall", duration: 3.0, density: 0.8 },
    ReverbPreset { name: "room", duration: 1.0, density: 0.5 },
    ReverbPreset { name: "plate", duration: 2.0, density: 0.9 },
    ReverbPreset { name: "cathedral", duration: 5.0, density: 0.95 },
];

/// A constructed effect: its entry/exit nodes plus everything it owns
#[derive(Debug)]
pub struct EffectInstance {
    pub effect_type: EffectType,
    pub params: EffectParams,
    input: NodeId,
    output: NodeId,
    nodes: Vec<NodeId>,
}

impl EffectInstance {
    pub fn input(&self) -> NodeId {
        self.input
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Disconnect and drop every node the effect owns
    pub fn destroy(self, graph: &mut AudioGraph) {
        for node in self.nodes {
            graph.remove_node(node);
        }
    }
}

/// Builds effect instances and caches synthesized impulse responses
#[derive(Default)]
pub struct EffectFactory {
    impulses: HashMap<usize, Arc<ImpulseResponse>>,
}

impl EffectFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the node cluster for `tag` with `params`, applying defaults
    /// and clamping out-of-range values.
    pub fn create_effect(
        &mut self,
        graph: &mut AudioGraph,
        tag: &str,
        params: &EffectParams,
    ) -> EffectInstance {
        let effect_type = EffectType::from_tag(tag);
        let param = |name: &str, default: f32| params.get(name).copied().unwrap_or(default);

        let (input, output, nodes) = match &effect_type {
            EffectType::Reverb => {
                let preset = param("preset", 0.0).max(0.0) as usize;
                let wet = param("wet", 0.3).clamp(0.0, 1.0);
                let impulse = self.impulse_for(preset, graph.sample_rate());

                let input = graph.create_gain(1.0);
                let dry = graph.create_gain(1.0 - wet);
                let convolver = graph.add_node(NodeKind::Convolver { impulse });
                let wet_gain = graph.create_gain(wet);
                let output = graph.create_gain(1.0);

                wire(graph, input, dry);
                wire(graph, dry, output);
                wire(graph, input, convolver);
                wire(graph, convolver, wet_gain);
                wire(graph, wet_gain, output);

                (input, output, vec![input, dry, convolver, wet_gain, output])
            }
            EffectType::Lowpass | EffectType::Highpass => {
                let (kind, default_hz) = if effect_type == EffectType::Lowpass {
                    (FilterKind::Lowpass, 1000.0)
                } else {
                    (FilterKind::Highpass, 500.0)
                };
                let frequency = param("frequency", default_hz).max(1.0);
                let q = param("q", 1.0).max(0.0001);
                let filter = graph.create_filter(kind, frequency, q);
                (filter, filter, vec![filter])
            }
            EffectType::Compressor => {
                let node = graph.add_node(NodeKind::Compressor(CompressorNode {
                    threshold: param("threshold", -24.0).clamp(-100.0, 0.0),
                    knee: param("knee", 30.0).clamp(0.0, 40.0),
                    ratio: param("ratio", 12.0).clamp(1.0, 20.0),
                    attack: param("attack", 0.003).clamp(0.0, 1.0),
                    release: param("release", 0.25).clamp(0.0, 1.0),
                }));
                (node, node, vec![node])
            }
            EffectType::Delay => {
                let time = param("time", 0.5).clamp(0.0, MAX_DELAY_SECONDS);
                let feedback = param("feedback", 0.3).clamp(0.0, MAX_FEEDBACK);
                let wet = param("wet", 0.5).clamp(0.0, 1.0);

                let input = graph.create_gain(1.0);
                let delay = graph.add_node(NodeKind::Delay {
                    delay_time: AudioParam::new(time),
                    max_delay: MAX_DELAY_SECONDS,
                });
                let feedback_gain = graph.create_gain(feedback);
                let wet_gain = graph.create_gain(wet);
                let output = graph.create_gain(1.0);

                wire(graph, input, output);
                wire(graph, input, delay);
                wire(graph, delay, feedback_gain);
                wire(graph, feedback_gain, delay);
                wire(graph, delay, wet_gain);
                wire(graph, wet_gain, output);

                (
                    input,
                    output,
                    vec![input, delay, feedback_gain, wet_gain, output],
                )
            }
            EffectType::Passthrough(tag) => {
                tracing::debug!("Audio: unknown effect type '{tag}', using passthrough");
                let node = graph.create_gain(1.0);
                (node, node, vec![node])
            }
        };

        EffectInstance {
            effect_type,
            params: params.clone(),
            input,
            output,
            nodes,
        }
    }

    /// Number of distinct impulse responses synthesized so far
    pub fn cached_impulse_count(&self) -> usize {
        self.impulses.len()
    }

    fn impulse_for(&mut self, preset: usize, sample_rate: u32) -> Arc<ImpulseResponse> {
        let preset = if preset < REVERB_PRESETS.len() { preset } else { 0 };
        self.impulses
            .entry(preset)
            .or_insert_with(|| {
                Arc::new(generate_impulse(
                    REVERB_PRESETS[preset],
                    sample_rate,
                    preset as u64,
                ))
            })
            .clone()
    }
}

/// Exponentially decaying stereo noise:
/// `sample = noise * density * exp(-t / (duration * 0.3))`, channels independent.
pub fn generate_impulse(preset: ReverbPreset, sample_rate: u32, seed: u64) -> ImpulseResponse {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = (sample_rate as f32 * preset.duration) as usize;
    let decay = preset.duration * 0.3;

    let frames = (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let envelope = preset.density * (-t / decay).exp();
            Frame {
                left: rng.gen_range(-1.0..=1.0) * envelope,
                right: rng.gen_range(-1.0..=1.0) * envelope,
            }
        })
        .collect();

    ImpulseResponse {
        sample_rate,
        frames,
    }
}

/// Internal wiring between freshly created nodes cannot fail
fn wire(graph: &mut AudioGraph, from: NodeId, to: NodeId) {
    let _ = graph.connect(from, to);
}
