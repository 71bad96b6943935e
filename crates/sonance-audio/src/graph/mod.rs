//! The signal graph the engine drives
//!
//! `AudioGraph` holds every node, the connections between them and the
//! clock that anchors parameter automation. Topology changes always
//! disconnect before reconnecting, so a node never ends up with two
//! simultaneous output paths unless it was wired that way on purpose
//! (effect splits, the delay feedback loop).

mod node;
mod param;

pub use node::{
    CompressorNode, FilterKind, FilterNode, ImpulseResponse, NodeId, NodeKind, PannerNode,
    SourceNode, SourceState,
};
pub use param::{AudioParam, ParamEvent};

use crate::buffer::AudioBuffer;
use sonance_core::{Clock, Vec3};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Node-level failures. The engine absorbs all of these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Unknown node: {0:?}")]
    UnknownNode(NodeId),

    #[error("Node {0:?} is not a {1} node")]
    WrongKind(NodeId, &'static str),

    #[error("Source {0:?} has already been started")]
    SourceAlreadyStarted(NodeId),

    #[error("Source {0:?} is not playing")]
    SourceNotPlaying(NodeId),
}

pub struct AudioGraph {
    clock: Arc<dyn Clock>,
    sample_rate: u32,
    nodes: HashMap<NodeId, NodeKind>,
    /// Outgoing connections per node, in connection order
    edges: HashMap<NodeId, Vec<NodeId>>,
    listener: Vec3,
    next_id: u64,
}

impl AudioGraph {
    pub fn new(clock: Arc<dyn Clock>, sample_rate: u32) -> Self {
        Self {
            clock,
            sample_rate: sample_rate.max(1),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            listener: Vec3::ZERO,
            next_id: 1,
        }
    }

    /// Current audio clock time in seconds
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn listener(&self) -> Vec3 {
        self.listener
    }

    pub fn set_listener(&mut self, position: Vec3) {
        self.listener = position;
    }

    // --- Node creation ---

    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, kind);
        id
    }

    pub fn create_gain(&mut self, value: f32) -> NodeId {
        self.add_node(NodeKind::Gain {
            gain: AudioParam::new(value),
        })
    }

    pub fn create_source(&mut self, buffer: Arc<AudioBuffer>, looping: bool, rate: f32) -> NodeId {
        self.add_node(NodeKind::Source(SourceNode {
            buffer,
            looping,
            playback_rate: AudioParam::new(rate),
            state: SourceState::Idle,
            started_at: 0.0,
            offset: 0.0,
        }))
    }

    pub fn create_filter(&mut self, kind: FilterKind, frequency: f32, q: f32) -> NodeId {
        self.add_node(NodeKind::Filter(FilterNode {
            kind,
            frequency: AudioParam::new(frequency),
            q: AudioParam::new(q),
        }))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id == NodeId::DESTINATION || self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeKind> {
        self.nodes.get_mut(&id)
    }

    /// Number of live nodes, not counting the destination
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Disconnect a node in both directions and drop it
    pub fn remove_node(&mut self, id: NodeId) {
        if id == NodeId::DESTINATION {
            return;
        }
        self.edges.remove(&id);
        for outputs in self.edges.values_mut() {
            outputs.retain(|&to| to != id);
        }
        self.nodes.remove(&id);
    }

    // --- Connections ---

    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&from) {
            return Err(GraphError::UnknownNode(from));
        }
        if !self.contains(to) {
            return Err(GraphError::UnknownNode(to));
        }
        let outputs = self.edges.entry(from).or_default();
        if !outputs.contains(&to) {
            outputs.push(to);
        }
        Ok(())
    }

    /// Drop every outgoing connection of `from`
    pub fn disconnect(&mut self, from: NodeId) {
        self.edges.remove(&from);
    }

    pub fn disconnect_from(&mut self, from: NodeId, to: NodeId) {
        if let Some(outputs) = self.edges.get_mut(&from) {
            outputs.retain(|&o| o != to);
        }
    }

    pub fn outputs(&self, id: NodeId) -> &[NodeId] {
        self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn inputs(&self, id: NodeId) -> Vec<NodeId> {
        let mut inputs: Vec<NodeId> = self
            .edges
            .iter()
            .filter(|(_, outputs)| outputs.contains(&id))
            .map(|(&from, _)| from)
            .collect();
        inputs.sort();
        inputs
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.outputs(from).contains(&to)
    }

    /// Whether any path leads from `id` to the output device
    pub fn reaches_destination(&self, id: NodeId) -> bool {
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == NodeId::DESTINATION {
                return true;
            }
            if seen.insert(current) {
                stack.extend_from_slice(self.outputs(current));
            }
        }
        false
    }

    /// Largest product of gain-node values at time `t` over the paths from
    /// `id` to the destination, or `None` when the destination is unreachable.
    ///
    /// Panners contribute their distance attenuation; other processing nodes
    /// count as unity.
    pub fn audible_gain(&self, id: NodeId, t: f64) -> Option<f32> {
        let mut visiting = HashSet::new();
        self.audible_gain_inner(id, t, &mut visiting)
    }

    fn audible_gain_inner(
        &self,
        id: NodeId,
        t: f64,
        visiting: &mut HashSet<NodeId>,
    ) -> Option<f32> {
        if id == NodeId::DESTINATION {
            return Some(1.0);
        }
        if !visiting.insert(id) {
            return None;
        }

        let own = match self.nodes.get(&id) {
            Some(NodeKind::Gain { gain }) => gain.value_at(t),
            Some(NodeKind::Panner(panner)) => panner.distance_gain(self.listener),
            Some(_) => 1.0,
            None => {
                visiting.remove(&id);
                return None;
            }
        };

        let best = self
            .outputs(id)
            .to_vec()
            .into_iter()
            .filter_map(|next| self.audible_gain_inner(next, t, visiting))
            .fold(None, |acc: Option<f32>, g| Some(acc.map_or(g, |a| a.max(g))));

        visiting.remove(&id);
        best.map(|downstream| own * downstream)
    }

    // --- Parameters ---

    /// The gain parameter of a gain node
    pub fn gain_param(&self, id: NodeId) -> Option<&AudioParam> {
        match self.nodes.get(&id) {
            Some(NodeKind::Gain { gain }) => Some(gain),
            _ => None,
        }
    }

    pub fn gain_param_mut(&mut self, id: NodeId) -> Option<&mut AudioParam> {
        match self.nodes.get_mut(&id) {
            Some(NodeKind::Gain { gain }) => Some(gain),
            _ => None,
        }
    }

    /// Ramp a gain node to `target` over `duration` seconds starting now
    pub fn ramp_gain(&mut self, id: NodeId, target: f32, duration: f64) {
        let now = self.now();
        if let Some(gain) = self.gain_param_mut(id) {
            gain.ramp_to(target, now, duration);
        }
    }

    pub fn filter_mut(&mut self, id: NodeId) -> Option<&mut FilterNode> {
        match self.nodes.get_mut(&id) {
            Some(NodeKind::Filter(filter)) => Some(filter),
            _ => None,
        }
    }

    pub fn panner_mut(&mut self, id: NodeId) -> Option<&mut PannerNode> {
        match self.nodes.get_mut(&id) {
            Some(NodeKind::Panner(panner)) => Some(panner),
            _ => None,
        }
    }

    pub fn source(&self, id: NodeId) -> Option<&SourceNode> {
        match self.nodes.get(&id) {
            Some(NodeKind::Source(source)) => Some(source),
            _ => None,
        }
    }

    fn source_mut(&mut self, id: NodeId) -> Result<&mut SourceNode, GraphError> {
        match self.nodes.get_mut(&id) {
            Some(NodeKind::Source(source)) => Ok(source),
            Some(_) => Err(GraphError::WrongKind(id, "source")),
            None => Err(GraphError::UnknownNode(id)),
        }
    }

    // --- Source lifecycle ---

    /// Start a source `offset` seconds into its buffer.
    ///
    /// Looping sources wrap the offset into the buffer length.
    pub fn start_source(&mut self, id: NodeId, offset: f64) -> Result<(), GraphError> {
        let now = self.now();
        let source = self.source_mut(id)?;
        if source.state != SourceState::Idle {
            return Err(GraphError::SourceAlreadyStarted(id));
        }

        let duration = source.buffer.duration();
        let mut offset = offset.max(0.0);
        if source.looping && duration > 0.0 {
            offset %= duration;
        }

        source.offset = offset;
        source.started_at = now;
        source.state = SourceState::Playing;
        Ok(())
    }

    pub fn stop_source(&mut self, id: NodeId) -> Result<(), GraphError> {
        let now = self.now();
        let source = self.source_mut(id)?;
        if source.state != SourceState::Playing || source.has_finished(now) {
            source.state = SourceState::Stopped;
            return Err(GraphError::SourceNotPlaying(id));
        }
        source.state = SourceState::Stopped;
        Ok(())
    }

    /// Ramp a source's playback rate over `duration` seconds
    pub fn set_playback_rate(&mut self, id: NodeId, rate: f32, duration: f64) {
        let now = self.now();
        if let Ok(source) = self.source_mut(id) {
            source.playback_rate.ramp_to(rate, now, duration);
        }
    }

    pub fn is_source_playing(&self, id: NodeId) -> bool {
        let now = self.now();
        self.source(id)
            .map(|s| s.state == SourceState::Playing && !s.has_finished(now))
            .unwrap_or(false)
    }

    /// Every source currently producing sound, in id order
    pub fn playing_sources(&self) -> Vec<(NodeId, &SourceNode)> {
        let now = self.now();
        let mut playing: Vec<(NodeId, &SourceNode)> = self
            .nodes
            .iter()
            .filter_map(|(&id, kind)| match kind {
                NodeKind::Source(source)
                    if source.state == SourceState::Playing && !source.has_finished(now) =>
                {
                    Some((id, source))
                }
                _ => None,
            })
            .collect();
        playing.sort_by_key(|(id, _)| *id);
        playing
    }

    /// Mark every source that ran off the end of its buffer as stopped and
    /// return their ids (the engine's "ended" notifications).
    pub fn collect_ended_sources(&mut self) -> Vec<NodeId> {
        let now = self.now();
        let mut ended: Vec<NodeId> = self
            .nodes
            .iter_mut()
            .filter_map(|(&id, kind)| match kind {
                NodeKind::Source(source) if source.has_finished(now) => {
                    source.state = SourceState::Stopped;
                    Some(id)
                }
                _ => None,
            })
            .collect();
        ended.sort();
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonance_core::ManualClock;

    fn graph() -> (AudioGraph, ManualClock) {
        let clock = ManualClock::new();
        (AudioGraph::new(Arc::new(clock.clone()), 48_000), clock)
    }

    #[test]
    fn test_connect_and_reach_destination() {
        let (mut g, _) = graph();
        let a = g.create_gain(0.5);
        let b = g.create_gain(0.5);

        g.connect(a, b).unwrap();
        assert!(!g.reaches_destination(a));

        g.connect(b, NodeId::DESTINATION).unwrap();
        assert!(g.reaches_destination(a));
        assert!((g.audible_gain(a, 0.0).unwrap() - 0.25).abs() < 1e-6);
        assert_eq!(g.inputs(b), vec![a]);
    }

    #[test]
    fn test_connect_unknown_node_fails() {
        let (mut g, _) = graph();
        let a = g.create_gain(1.0);
        assert_eq!(
            g.connect(a, NodeId(999)),
            Err(GraphError::UnknownNode(NodeId(999)))
        );
    }

    #[test]
    fn test_remove_node_drops_incoming_edges() {
        let (mut g, _) = graph();
        let a = g.create_gain(1.0);
        let b = g.create_gain(1.0);
        g.connect(a, b).unwrap();

        g.remove_node(b);
        assert!(g.outputs(a).is_empty());
        assert!(g.node(b).is_none());
    }

    #[test]
    fn test_audible_gain_handles_feedback_cycle() {
        let (mut g, _) = graph();
        let input = g.create_gain(1.0);
        let delay = g.add_node(NodeKind::Delay {
            delay_time: AudioParam::new(0.5),
            max_delay: 2.0,
        });
        let feedback = g.create_gain(0.3);
        g.connect(input, delay).unwrap();
        g.connect(delay, feedback).unwrap();
        g.connect(feedback, delay).unwrap();
        g.connect(delay, NodeId::DESTINATION).unwrap();

        assert_eq!(g.audible_gain(input, 0.0), Some(1.0));
    }

    #[test]
    fn test_source_is_single_use() {
        let (mut g, clock) = graph();
        let buffer = Arc::new(AudioBuffer::silent(48_000, 1.0));
        let src = g.create_source(buffer, false, 1.0);

        g.start_source(src, 0.0).unwrap();
        assert!(g.is_source_playing(src));
        assert_eq!(
            g.start_source(src, 0.0),
            Err(GraphError::SourceAlreadyStarted(src))
        );

        clock.set(0.5);
        g.stop_source(src).unwrap();
        assert_eq!(g.stop_source(src), Err(GraphError::SourceNotPlaying(src)));
    }

    #[test]
    fn test_collect_ended_sources() {
        let (mut g, clock) = graph();
        let buffer = Arc::new(AudioBuffer::silent(48_000, 1.0));
        let once = g.create_source(buffer.clone(), false, 1.0);
        let looped = g.create_source(buffer, true, 1.0);
        g.start_source(once, 0.0).unwrap();
        g.start_source(looped, 0.0).unwrap();

        clock.set(0.5);
        assert!(g.collect_ended_sources().is_empty());

        clock.set(1.5);
        assert_eq!(g.collect_ended_sources(), vec![once]);
        assert!(g.collect_ended_sources().is_empty());
        assert!(g.is_source_playing(looped));

        // Stopping a naturally finished source reports it, callers ignore it
        assert!(g.stop_source(once).is_err());
    }

    #[test]
    fn test_playing_sources_skip_idle_and_finished() {
        let (mut g, clock) = graph();
        let buffer = Arc::new(AudioBuffer::silent(48_000, 1.0));
        let idle = g.create_source(buffer.clone(), false, 1.0);
        let once = g.create_source(buffer.clone(), false, 1.0);
        let looped = g.create_source(buffer, true, 1.0);
        g.start_source(once, 0.0).unwrap();
        g.start_source(looped, 0.0).unwrap();

        let ids: Vec<NodeId> = g.playing_sources().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![once, looped]);
        assert!(!ids.contains(&idle));

        clock.set(1.5);
        let ids: Vec<NodeId> = g.playing_sources().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![looped]);
    }

    #[test]
    fn test_looping_offset_wraps() {
        let (mut g, _) = graph();
        let buffer = Arc::new(AudioBuffer::silent(1000, 2.0));
        let src = g.create_source(buffer, true, 1.0);
        g.start_source(src, 5.0).unwrap();
        assert!((g.source(src).unwrap().offset - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ramp_gain_anchors_to_clock() {
        let (mut g, clock) = graph();
        let gain = g.create_gain(1.0);
        clock.set(3.0);
        g.ramp_gain(gain, 0.0, 1.0);

        let param = g.gain_param(gain).unwrap();
        assert_eq!(param.end_time(), Some(4.0));
        assert!((param.value_at(3.5) - 0.5).abs() < 1e-6);
    }
}
