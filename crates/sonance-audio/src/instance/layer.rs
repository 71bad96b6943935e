//! Named layers: extra sounds attached to the same entity

use super::{InstanceKey, InstanceParams, SoundInstanceManager, SpatialParams};
use crate::buffer::BufferCache;
use crate::bus::FALLBACK_BUS;
use crate::mixer::Mixer;
use serde::{Deserialize, Serialize};
use sonance_core::{EntityId, Vec3};

/// How a layer should be created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LayerOptions {
    pub volume: f32,
    pub pitch: f32,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub bus: String,
    /// Position the layer where the primary sound currently is
    pub spatial: bool,
    /// Start playing immediately
    pub autoplay: bool,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pitch: 1.0,
            looping: false,
            bus: FALLBACK_BUS.to_string(),
            spatial: false,
            autoplay: false,
        }
    }
}

impl SoundInstanceManager {
    /// Attach a named layer to an entity.
    ///
    /// Rejected when the slot name is empty, the buffer is missing, or the
    /// entity already has the maximum number of layers.
    pub fn add_layer(
        &mut self,
        mixer: &mut Mixer,
        cache: &BufferCache,
        entity: EntityId,
        slot: &str,
        asset_id: &str,
        options: &LayerOptions,
    ) -> bool {
        if slot.is_empty() {
            tracing::warn!("Audio: layer name for entity {entity} must not be empty");
            return false;
        }

        let spatial = options.spatial.then(|| self.inherited_spatial(mixer, entity));
        let params = InstanceParams {
            volume: options.volume,
            pitch: options.pitch,
            looping: options.looping,
            bus: options.bus.clone(),
            spatial,
        };

        if !self.create_instance(mixer, cache, entity, asset_id, &params, slot) {
            return false;
        }
        if options.autoplay {
            self.play(mixer, &InstanceKey::new(entity, slot));
        }
        true
    }

    pub fn remove_layer(&mut self, mixer: &mut Mixer, entity: EntityId, slot: &str) -> bool {
        if slot.is_empty() {
            return false;
        }
        self.teardown(mixer, &InstanceKey::new(entity, slot))
    }

    /// Remove every named layer, leaving the primary sound alone
    pub fn remove_all_layers(&mut self, mixer: &mut Mixer, entity: EntityId) -> usize {
        let layers: Vec<InstanceKey> = self
            .keys_for_entity(entity)
            .into_iter()
            .filter(|k| !k.is_primary())
            .collect();
        for key in &layers {
            self.teardown(mixer, key);
        }
        layers.len()
    }

    pub fn layer_count(&self, entity: EntityId) -> usize {
        self.instances
            .keys()
            .filter(|k| k.entity == entity && !k.is_primary())
            .count()
    }

    pub fn layer_slots(&self, entity: EntityId) -> Vec<&str> {
        self.instances
            .keys()
            .filter(|k| k.entity == entity && !k.is_primary())
            .map(|k| k.slot.as_str())
            .collect()
    }

    /// Spatial settings copied from the primary instance's panner as it is
    /// right now, or configured defaults at the origin
    fn inherited_spatial(&self, mixer: &Mixer, entity: EntityId) -> SpatialParams {
        let primary = self
            .instances
            .get(&InstanceKey::primary(entity))
            .and_then(|i| i.panner)
            .and_then(|node| match mixer.graph.node(node) {
                Some(crate::graph::NodeKind::Panner(p)) => Some(p.clone()),
                _ => None,
            });

        match primary {
            Some(p) => SpatialParams {
                position: p.position,
                ref_distance: p.ref_distance,
                max_distance: p.max_distance,
                rolloff_factor: p.rolloff_factor,
            },
            None => SpatialParams::with_defaults(Vec3::ZERO, &self.config.spatial),
        }
    }
}
