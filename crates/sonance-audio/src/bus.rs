//! Bus graph: the named mixer channels and their solo/mute resolution
//!
//! Signal path per bus:
//! `gain (volume or 0) -> [effect chain] -> duck gain -> master input`,
//! with master's duck gain feeding the output device instead.

use crate::effect::{EffectDef, EffectFactory, EffectInstance};
use crate::graph::{AudioGraph, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MASTER_BUS: &str = "master";

/// Where instances of a deleted bus are rerouted
pub const FALLBACK_BUS: &str = "sfx";

/// Buses created alongside master when the graph initializes
pub const DEFAULT_BUSES: [&str; 4] = ["sfx", "music", "ambient", "voice"];

/// Full description of one bus as pushed by the authoring layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    pub name: String,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub soloed: bool,
    #[serde(default)]
    pub effects: Vec<EffectDef>,
}

fn default_volume() -> f32 {
    1.0
}

impl BusConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            volume: 1.0,
            muted: false,
            soloed: false,
            effects: Vec::new(),
        }
    }

    /// Parse a JSON array of bus configs
    pub fn list_from_json(json: &str) -> sonance_core::Result<Vec<BusConfig>> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a TOML document holding a `[[bus]]` array
    pub fn list_from_toml(source: &str) -> sonance_core::Result<Vec<BusConfig>> {
        #[derive(Deserialize)]
        struct Document {
            #[serde(default)]
            bus: Vec<BusConfig>,
        }
        let doc: Document = toml::from_str(source)?;
        Ok(doc.bus)
    }
}

/// A mixer channel
#[derive(Debug)]
pub struct Bus {
    pub name: String,
    pub volume: f32,
    pub muted: bool,
    pub soloed: bool,
    /// Derived from every bus's mute/solo state, see [`BusGraph::recompute_gains`]
    pub effective_muted: bool,
    /// The definitions last applied, disabled entries included
    pub effect_defs: Vec<EffectDef>,
    gain: NodeId,
    duck_gain: NodeId,
    chain: Vec<EffectInstance>,
}

impl Bus {
    /// Entry point sounds connect to
    pub fn input(&self) -> NodeId {
        self.gain
    }

    /// Gain stage driven by the ducking controller
    pub fn duck_node(&self) -> NodeId {
        self.duck_gain
    }

    /// Constructed effects, in signal order
    pub fn chain(&self) -> &[EffectInstance] {
        &self.chain
    }

    pub fn is_master(&self) -> bool {
        self.name == MASTER_BUS
    }

    fn target_gain(&self) -> f32 {
        if self.effective_muted {
            0.0
        } else {
            self.volume
        }
    }
}

/// The mixer: every bus keyed by name, wired into master
pub struct BusGraph {
    buses: BTreeMap<String, Bus>,
    effects: EffectFactory,
    /// Ramp applied to bus gain changes, in seconds
    ramp: f64,
}

impl BusGraph {
    /// Create master plus the default buses
    pub fn new(graph: &mut AudioGraph, ramp: f64) -> Self {
        let mut buses = Self {
            buses: BTreeMap::new(),
            effects: EffectFactory::new(),
            ramp,
        };

        let master = buses.build_bus(graph, MASTER_BUS, 1.0, NodeId::DESTINATION);
        buses.buses.insert(MASTER_BUS.to_string(), master);

        for name in DEFAULT_BUSES {
            buses.create_bus(graph, name, 1.0);
        }
        buses
    }

    pub fn get(&self, name: &str) -> Option<&Bus> {
        self.buses.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buses.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.buses.keys().map(|s| s.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bus> {
        self.buses.values()
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    pub fn effect_factory(&self) -> &EffectFactory {
        &self.effects
    }

    /// Name of the bus a sound asking for `name` lands on: the bus itself,
    /// else `sfx`, else master
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        if self.buses.contains_key(name) {
            return name;
        }
        let fallback = self.fallback_excluding(&[]);
        tracing::warn!("Audio: bus '{name}' not found, routing to '{fallback}'");
        fallback
    }

    /// Input node of `name`, with [`BusGraph::resolve`] applied
    pub fn input_for(&self, name: &str) -> NodeId {
        self.buses
            .get(self.resolve(name))
            .map(Bus::input)
            .unwrap_or(NodeId::DESTINATION)
    }

    /// The bus that inherits instances when `deleted` goes away
    pub fn fallback_for(&self, deleted: &str) -> &'static str {
        self.fallback_excluding(&[deleted.to_string()])
    }

    /// Fallback bus once every bus in `removed` is gone
    pub fn fallback_excluding(&self, removed: &[String]) -> &'static str {
        let survives = !removed.iter().any(|name| name == FALLBACK_BUS);
        if survives && self.buses.contains_key(FALLBACK_BUS) {
            FALLBACK_BUS
        } else {
            MASTER_BUS
        }
    }

    /// Create a bus wired straight into master. Returns false if the name is
    /// empty or already taken.
    pub fn create_bus(&mut self, graph: &mut AudioGraph, name: &str, volume: f32) -> bool {
        if name.trim().is_empty() || self.buses.contains_key(name) {
            return false;
        }
        let master_input = self.input_for(MASTER_BUS);
        let bus = self.build_bus(graph, name, volume, master_input);
        self.buses.insert(name.to_string(), bus);
        tracing::debug!("Audio: created bus '{name}'");
        true
    }

    /// Whether [`BusGraph::delete_bus`] would accept `name`
    pub fn can_delete(&self, name: &str) -> bool {
        name != MASTER_BUS && self.buses.contains_key(name)
    }

    /// Tear down a bus's nodes. Rerouting instances is the caller's job and
    /// must happen first, while the old input still exists.
    pub fn delete_bus(&mut self, graph: &mut AudioGraph, name: &str) -> bool {
        if !self.remove_bus(graph, name) {
            return false;
        }
        self.recompute_gains(graph);
        true
    }

    fn remove_bus(&mut self, graph: &mut AudioGraph, name: &str) -> bool {
        if !self.can_delete(name) {
            return false;
        }
        let Some(mut bus) = self.buses.remove(name) else {
            return false;
        };

        for effect in bus.chain.drain(..) {
            effect.destroy(graph);
        }
        graph.remove_node(bus.gain);
        graph.remove_node(bus.duck_gain);
        tracing::debug!("Audio: deleted bus '{name}'");
        true
    }

    pub fn set_bus_volume(&mut self, graph: &mut AudioGraph, name: &str, volume: f32) -> bool {
        let Some(bus) = self.buses.get_mut(name) else {
            return false;
        };
        bus.volume = volume.clamp(0.0, 1.0);
        self.recompute_gains(graph);
        true
    }

    pub fn mute_bus(&mut self, graph: &mut AudioGraph, name: &str, muted: bool) -> bool {
        let Some(bus) = self.buses.get_mut(name) else {
            return false;
        };
        bus.muted = muted;
        self.recompute_gains(graph);
        true
    }

    pub fn solo_bus(&mut self, graph: &mut AudioGraph, name: &str, soloed: bool) -> bool {
        let Some(bus) = self.buses.get_mut(name) else {
            return false;
        };
        bus.soloed = soloed;
        self.recompute_gains(graph);
        true
    }

    /// Replace a bus's whole effect chain with fresh effects built from the
    /// enabled entries of `defs`, in order.
    pub fn set_bus_effects(&mut self, graph: &mut AudioGraph, name: &str, defs: &[EffectDef]) -> bool {
        let Some(bus) = self.buses.get_mut(name) else {
            return false;
        };

        graph.disconnect(bus.gain);
        for effect in bus.chain.drain(..) {
            effect.destroy(graph);
        }

        let mut chain = Vec::new();
        for def in defs.iter().filter(|d| d.enabled) {
            chain.push(
                self.effects
                    .create_effect(graph, &def.effect_type, &def.params),
            );
        }

        let mut upstream = bus.gain;
        for effect in &chain {
            let _ = graph.connect(upstream, effect.input());
            upstream = effect.output();
        }
        let _ = graph.connect(upstream, bus.duck_gain);

        bus.chain = chain;
        bus.effect_defs = defs.to_vec();
        true
    }

    /// Buses that [`BusGraph::apply_config`] would delete for `configs`
    pub fn stale_buses(&self, configs: &[BusConfig]) -> Vec<String> {
        let wanted: BTreeSet<&str> = configs.iter().map(|c| c.name.as_str()).collect();
        self.buses
            .keys()
            .filter(|name| name.as_str() != MASTER_BUS && !wanted.contains(name.as_str()))
            .cloned()
            .collect()
    }

    /// Bulk reconciliation against a complete bus list.
    ///
    /// Buses missing from `configs` are deleted without rerouting anything;
    /// [`crate::AudioEngine::apply_bus_config`] moves their sounds first.
    /// Gains are recomputed once, after every bus has been updated.
    pub fn apply_config(&mut self, graph: &mut AudioGraph, configs: &[BusConfig]) {
        let stale = self.stale_buses(configs);
        self.configure(graph, configs);
        self.remove_buses(graph, &stale);
        self.recompute_gains(graph);
    }

    /// Create or update every bus in `configs`. Gains are left for the
    /// caller to recompute.
    pub fn configure(&mut self, graph: &mut AudioGraph, configs: &[BusConfig]) {
        for config in configs {
            if !self.buses.contains_key(&config.name) {
                self.create_bus(graph, &config.name, config.volume);
            }
            if let Some(bus) = self.buses.get_mut(&config.name) {
                bus.volume = config.volume.clamp(0.0, 1.0);
                bus.muted = config.muted;
                bus.soloed = config.soloed;
            }
            self.set_bus_effects(graph, &config.name, &config.effects);
        }
    }

    /// Tear down several buses, recomputing nothing. Master is skipped.
    pub fn remove_buses(&mut self, graph: &mut AudioGraph, names: &[String]) {
        for name in names {
            self.remove_bus(graph, name);
        }
    }

    /// Resolve effective mute for every bus and ramp each gain stage to
    /// `0` or its volume.
    ///
    /// Soloing any non-master bus silences every other non-master bus.
    /// Explicit mute always wins over solo. Master ignores solo.
    pub fn recompute_gains(&mut self, graph: &mut AudioGraph) {
        let any_soloed = self.buses.values().any(|b| !b.is_master() && b.soloed);

        for bus in self.buses.values_mut() {
            bus.effective_muted = if bus.is_master() {
                bus.muted
            } else {
                bus.muted || (any_soloed && !bus.soloed)
            };
            graph.ramp_gain(bus.gain, bus.target_gain(), self.ramp);
        }
    }

    fn build_bus(&mut self, graph: &mut AudioGraph, name: &str, volume: f32, target: NodeId) -> Bus {
        let volume = volume.clamp(0.0, 1.0);
        let gain = graph.create_gain(volume);
        let duck_gain = graph.create_gain(1.0);
        let _ = graph.connect(gain, duck_gain);
        let _ = graph.connect(duck_gain, target);

        Bus {
            name: name.to_string(),
            volume,
            muted: false,
            soloed: false,
            effective_muted: false,
            effect_defs: Vec::new(),
            gain,
            duck_gain,
            chain: Vec::new(),
        }
    }
}
