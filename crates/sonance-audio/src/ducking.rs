//! Sidechain ducking between buses
//!
//! Each bus carries a count of the sounds currently playing through it.
//! Rules only fire on the edges of that count: 0 -> 1 attacks every rule
//! triggered by the bus, 1 -> 0 releases them. Overlapping voice lines
//! therefore hold the duck instead of pumping it.

use crate::bus::BusGraph;
use crate::graph::AudioGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// While `trigger_bus` has sound, hold `target_bus` at `duck_level`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuckingRule {
    pub trigger_bus: String,
    pub target_bus: String,
    pub duck_level: f32,
    #[serde(default = "default_attack_ms")]
    pub attack_ms: f32,
    #[serde(default = "default_release_ms")]
    pub release_ms: f32,
}

fn default_attack_ms() -> f32 {
    100.0
}

fn default_release_ms() -> f32 {
    500.0
}

impl DuckingRule {
    pub fn new(trigger_bus: &str, target_bus: &str, duck_level: f32) -> Self {
        Self {
            trigger_bus: trigger_bus.to_string(),
            target_bus: target_bus.to_string(),
            duck_level,
            attack_ms: default_attack_ms(),
            release_ms: default_release_ms(),
        }
    }

    pub fn with_timing(mut self, attack_ms: f32, release_ms: f32) -> Self {
        self.attack_ms = attack_ms;
        self.release_ms = release_ms;
        self
    }

    fn same_pair(&self, trigger_bus: &str, target_bus: &str) -> bool {
        self.trigger_bus == trigger_bus && self.target_bus == target_bus
    }
}

impl Default for DuckingRule {
    /// Dialogue pulls music down to 30%
    fn default() -> Self {
        Self::new("voice", "music", 0.3)
    }
}

#[derive(Debug, Default)]
pub struct DuckingController {
    rules: Vec<DuckingRule>,
    active: HashMap<String, u32>,
}

impl DuckingController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule, replacing any rule for the same trigger/target pair
    pub fn add_rule(&mut self, mut rule: DuckingRule) {
        rule.duck_level = rule.duck_level.clamp(0.0, 1.0);
        rule.attack_ms = rule.attack_ms.max(0.0);
        rule.release_ms = rule.release_ms.max(0.0);

        match self
            .rules
            .iter_mut()
            .find(|r| r.same_pair(&rule.trigger_bus, &rule.target_bus))
        {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    /// Remove the rule for a pair. A target currently held down by it is
    /// released.
    pub fn remove_rule(
        &mut self,
        graph: &mut AudioGraph,
        buses: &BusGraph,
        trigger_bus: &str,
        target_bus: &str,
    ) -> bool {
        let Some(index) = self
            .rules
            .iter()
            .position(|r| r.same_pair(trigger_bus, target_bus))
        else {
            return false;
        };
        let rule = self.rules.remove(index);
        if self.active_count(trigger_bus) > 0 {
            release(graph, buses, &rule);
        }
        true
    }

    pub fn rules(&self) -> &[DuckingRule] {
        &self.rules
    }

    /// Sounds currently playing through `bus`
    pub fn active_count(&self, bus: &str) -> u32 {
        self.active.get(bus).copied().unwrap_or(0)
    }

    /// A sound started playing on `bus`
    pub fn on_play(&mut self, graph: &mut AudioGraph, buses: &BusGraph, bus: &str) {
        let count = self.active.entry(bus.to_string()).or_insert(0);
        *count += 1;
        if *count != 1 {
            return;
        }

        for rule in self.rules.iter().filter(|r| r.trigger_bus == bus) {
            let Some(target) = buses.get(&rule.target_bus) else {
                continue;
            };
            tracing::trace!(
                "Audio: '{}' ducks '{}' to {}",
                rule.trigger_bus,
                rule.target_bus,
                rule.duck_level
            );
            graph.ramp_gain(
                target.duck_node(),
                rule.duck_level,
                rule.attack_ms as f64 / 1000.0,
            );
        }
    }

    /// A sound stopped playing on `bus`
    pub fn on_stop(&mut self, graph: &mut AudioGraph, buses: &BusGraph, bus: &str) {
        let Some(count) = self.active.get_mut(bus) else {
            return;
        };
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count != 0 {
            return;
        }

        self.active.remove(bus);
        for rule in self.rules.iter().filter(|r| r.trigger_bus == bus) {
            release(graph, buses, rule);
        }
    }

    /// Forget every active trigger and bring every duck gain back to unity
    pub fn reset(&mut self, graph: &mut AudioGraph, buses: &BusGraph) {
        let active: Vec<String> = self.active.drain().map(|(bus, _)| bus).collect();
        for rule in self
            .rules
            .iter()
            .filter(|r| active.contains(&r.trigger_bus))
        {
            release(graph, buses, rule);
        }
    }
}

fn release(graph: &mut AudioGraph, buses: &BusGraph, rule: &DuckingRule) {
    if let Some(target) = buses.get(&rule.target_bus) {
        graph.ramp_gain(target.duck_node(), 1.0, rule.release_ms as f64 / 1000.0);
    }
}
