//! Per-entity occlusion filtering
//!
//! Occlusion is enabled per entity; every instance of that entity then gets
//! a low-pass filter at the end of its chain. Whether the entity is actually
//! blocked comes from the host's line-of-sight checks.

use super::{InstanceKey, SoundInstanceManager};
use crate::graph::{AudioGraph, FilterKind, NodeId};
use crate::mixer::Mixer;
use sonance_core::EntityId;

const OCCLUSION_Q: f32 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct OcclusionState {
    pub occluded: bool,
}

impl SoundInstanceManager {
    /// Attach or detach occlusion filters for every instance of `entity`.
    ///
    /// Returns false when the entity was already in the requested state.
    pub fn set_occlusion(&mut self, mixer: &mut Mixer, entity: EntityId, enabled: bool) -> bool {
        if enabled == self.occlusion.contains_key(&entity) {
            return false;
        }

        let keys = self.keys_for_entity(entity);
        if enabled {
            let state = OcclusionState::default();
            self.occlusion.insert(entity, state);
            for key in &keys {
                let filter = self.create_occlusion_filter(&mut mixer.graph, &state);
                self.swap_occlusion_node(mixer, key, Some(filter));
            }
        } else {
            self.occlusion.remove(&entity);
            for key in &keys {
                self.swap_occlusion_node(mixer, key, None);
            }
        }
        tracing::debug!("Audio: occlusion for entity {entity} set to {enabled}");
        true
    }

    /// Ramp the cutoff of every occlusion filter on `entity` towards the
    /// muffled or clear frequency
    pub fn update_occlusion_state(&mut self, mixer: &mut Mixer, entity: EntityId, occluded: bool) -> bool {
        let Some(state) = self.occlusion.get_mut(&entity) else {
            tracing::trace!("Audio: occlusion update for entity {entity} without a filter");
            return false;
        };
        state.occluded = occluded;

        let target = self.cutoff_for(occluded);
        let now = mixer.now();
        let ramp = self.config.occlusion_ramp();
        for instance in self.instances.values().filter(|i| i.key.entity == entity) {
            let Some(node) = instance.occlusion else {
                continue;
            };
            if let Some(filter) = mixer.graph.filter_mut(node) {
                filter.frequency.ramp_to(target, now, ramp);
            }
        }
        true
    }

    pub fn is_occluded(&self, entity: EntityId) -> bool {
        self.occlusion.get(&entity).is_some_and(|s| s.occluded)
    }

    pub fn has_occlusion(&self, entity: EntityId) -> bool {
        self.occlusion.contains_key(&entity)
    }

    pub(super) fn create_occlusion_filter(&self, graph: &mut AudioGraph, state: &OcclusionState) -> NodeId {
        graph.create_filter(FilterKind::Lowpass, self.cutoff_for(state.occluded), OCCLUSION_Q)
    }

    fn cutoff_for(&self, occluded: bool) -> f32 {
        if occluded {
            self.config.occlusion_muffled_hz
        } else {
            self.config.occlusion_clear_hz
        }
    }

    fn swap_occlusion_node(&mut self, mixer: &mut Mixer, key: &InstanceKey, filter: Option<NodeId>) {
        let Some(instance) = self.instances.get_mut(key) else {
            return;
        };
        if let Some(old) = std::mem::replace(&mut instance.occlusion, filter) {
            mixer.graph.remove_node(old);
        }
        instance.rewire(mixer);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{fixture, E1};
    use crate::graph::NodeKind;

    fn cutoff(f: &super::super::tests::Fixture, node: crate::graph::NodeId, t: f64) -> f32 {
        match f.mixer.graph.node(node) {
            Some(NodeKind::Filter(filter)) => filter.frequency.value_at(t),
            _ => panic!("expected filter"),
        }
    }

    #[test]
    fn test_enable_inserts_filter_into_live_chain() {
        let mut f = fixture();
        let key = f.create(E1, "", "sfx");
        f.sounds.play(&mut f.mixer, &key);

        assert!(f.sounds.set_occlusion(&mut f.mixer, E1, true));
        assert!(!f.sounds.set_occlusion(&mut f.mixer, E1, true));

        let instance = f.sounds.get(&key).unwrap();
        let filter = instance.occlusion_node().unwrap();
        assert_eq!(instance.output(), filter);
        assert!(f.mixer.graph.is_connected(instance.gain_node(), filter));
        let sfx = f.mixer.buses.get("sfx").unwrap().input();
        assert_eq!(f.mixer.graph.outputs(filter), &[sfx]);
        assert_eq!(f.mixer.graph.outputs(instance.gain_node()), &[filter]);
        assert_eq!(cutoff(&f, filter, 0.0), 5000.0);
    }

    #[test]
    fn test_occlusion_ramps_cutoff() {
        let mut f = fixture();
        let key = f.create(E1, "", "sfx");
        f.sounds.set_occlusion(&mut f.mixer, E1, true);
        let filter = f.sounds.get(&key).unwrap().occlusion_node().unwrap();

        f.clock.set(2.0);
        assert!(f.sounds.update_occlusion_state(&mut f.mixer, E1, true));
        assert!(f.sounds.is_occluded(E1));
        assert_eq!(cutoff(&f, filter, 2.0), 5000.0);
        assert!((cutoff(&f, filter, 2.05) - 2750.0).abs() < 1.0);
        assert_eq!(cutoff(&f, filter, 2.1), 500.0);

        f.clock.set(3.0);
        f.sounds.update_occlusion_state(&mut f.mixer, E1, false);
        assert_eq!(cutoff(&f, filter, 3.2), 5000.0);
    }

    #[test]
    fn test_update_without_filter_is_ignored() {
        let mut f = fixture();
        f.create(E1, "", "sfx");
        assert!(!f.sounds.update_occlusion_state(&mut f.mixer, E1, true));
        assert!(!f.sounds.is_occluded(E1));
    }

    #[test]
    fn test_new_instances_pick_up_current_state() {
        let mut f = fixture();
        f.create(E1, "", "sfx");
        f.sounds.set_occlusion(&mut f.mixer, E1, true);
        f.sounds.update_occlusion_state(&mut f.mixer, E1, true);

        let layer = f.create(E1, "hum", "sfx");
        let filter = f.sounds.get(&layer).unwrap().occlusion_node().unwrap();
        assert_eq!(cutoff(&f, filter, 0.0), 500.0);
    }

    #[test]
    fn test_disable_removes_filter() {
        let mut f = fixture();
        let key = f.create(E1, "", "sfx");
        f.sounds.play(&mut f.mixer, &key);
        f.sounds.set_occlusion(&mut f.mixer, E1, true);
        let filter = f.sounds.get(&key).unwrap().occlusion_node().unwrap();

        assert!(f.sounds.set_occlusion(&mut f.mixer, E1, false));
        let instance = f.sounds.get(&key).unwrap();
        assert!(instance.occlusion_node().is_none());
        assert!(!f.mixer.graph.contains(filter));
        let sfx = f.mixer.buses.get("sfx").unwrap().input();
        assert_eq!(f.mixer.graph.outputs(instance.gain_node()), &[sfx]);
        assert!(!f.sounds.has_occlusion(E1));
    }
}
