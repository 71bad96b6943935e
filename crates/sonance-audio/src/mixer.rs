//! The graph, the bus graph and the ducking controller, owned together
//!
//! Sound instances and the music sequencer borrow a `Mixer` to build their
//! nodes and to report play/stop transitions.

use crate::bus::BusGraph;
use crate::config::AudioConfig;
use crate::ducking::DuckingController;
use crate::graph::{AudioGraph, NodeId};
use sonance_core::Clock;
use std::sync::Arc;

pub struct Mixer {
    pub graph: AudioGraph,
    pub buses: BusGraph,
    pub ducking: DuckingController,
}

impl Mixer {
    pub fn new(clock: Arc<dyn Clock>, config: &AudioConfig) -> Self {
        let mut graph = AudioGraph::new(clock, config.sample_rate);
        let buses = BusGraph::new(&mut graph, config.param_ramp());
        let mut ducking = DuckingController::new();
        if let Some(rule) = &config.default_ducking {
            ducking.add_rule(rule.clone());
        }

        Self {
            graph,
            buses,
            ducking,
        }
    }

    pub fn now(&self) -> f64 {
        self.graph.now()
    }

    /// Input node for a bus, with the missing-bus fallback applied
    pub fn bus_input(&self, bus: &str) -> NodeId {
        self.buses.input_for(bus)
    }

    /// Report a sound starting on `bus`
    pub fn notify_play(&mut self, bus: &str) {
        self.ducking.on_play(&mut self.graph, &self.buses, bus);
    }

    /// Report a sound stopping on `bus`
    pub fn notify_stop(&mut self, bus: &str) {
        self.ducking.on_stop(&mut self.graph, &self.buses, bus);
    }

    /// Point `output` at a new bus input, dropping any previous bus wiring
    pub fn route(&mut self, output: NodeId, bus: &str) {
        let input = self.bus_input(bus);
        self.graph.disconnect(output);
        let _ = self.graph.connect(output, input);
    }
}
