//! Fire-and-forget transient sounds
//!
//! One-shots live in a bounded FIFO pool. They never loop, and they are torn
//! down as soon as their source reaches the end of the buffer.

use super::{SoundInstanceManager, SpatialParams, MAX_PITCH, MIN_PITCH};
use crate::buffer::BufferCache;
use crate::bus::FALLBACK_BUS;
use crate::graph::NodeId;
use crate::mixer::Mixer;
use serde::{Deserialize, Serialize};
use sonance_core::{OneShotId, Vec3};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OneShotOptions {
    pub volume: f32,
    pub pitch: f32,
    pub bus: String,
    /// Spatialize at this point using the configured distance defaults
    pub position: Option<Vec3>,
}

impl Default for OneShotOptions {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pitch: 1.0,
            bus: FALLBACK_BUS.to_string(),
            position: None,
        }
    }
}

pub(super) struct OneShot {
    pub id: OneShotId,
    pub bus: String,
    gain: NodeId,
    panner: Option<NodeId>,
    source: NodeId,
}

impl OneShot {
    pub fn output(&self) -> NodeId {
        self.panner.unwrap_or(self.gain)
    }

    fn release(self, mixer: &mut Mixer) {
        let _ = mixer.graph.stop_source(self.source);
        for node in [Some(self.source), Some(self.gain), self.panner]
            .into_iter()
            .flatten()
        {
            mixer.graph.remove_node(node);
        }
        mixer.notify_stop(&self.bus);
    }
}

impl SoundInstanceManager {
    /// Start a one-shot, evicting the oldest when the pool is full.
    ///
    /// Returns `None` only when the buffer is not loaded.
    pub fn play_one_shot(
        &mut self,
        mixer: &mut Mixer,
        cache: &BufferCache,
        asset_id: &str,
        options: &OneShotOptions,
    ) -> Option<OneShotId> {
        let Some(buffer) = cache.get(asset_id) else {
            tracing::warn!("Audio: buffer '{asset_id}' not loaded, skipping one-shot");
            return None;
        };

        while self.one_shots.len() >= self.config.max_one_shots.max(1) {
            if let Some(oldest) = self.one_shots.pop_front() {
                tracing::debug!("Audio: one-shot pool full, evicting {}", oldest.id);
                oldest.release(mixer);
            }
        }

        let gain = mixer.graph.create_gain(options.volume.clamp(0.0, 1.0));
        let panner = options.position.map(|position| {
            let spatial = SpatialParams::with_defaults(position, &self.config.spatial);
            mixer.graph.add_node(spatial.node())
        });
        let source = mixer
            .graph
            .create_source(buffer, false, options.pitch.clamp(MIN_PITCH, MAX_PITCH));

        let _ = mixer.graph.connect(source, gain);
        if let Some(panner) = panner {
            let _ = mixer.graph.connect(gain, panner);
        }

        let id = OneShotId(self.next_one_shot);
        self.next_one_shot += 1;
        let shot = OneShot {
            id,
            bus: mixer.buses.resolve(&options.bus).to_string(),
            gain,
            panner,
            source,
        };

        mixer.route(shot.output(), &shot.bus);
        let _ = mixer.graph.start_source(source, 0.0);
        mixer.notify_play(&shot.bus);
        self.one_shots.push_back(shot);
        Some(id)
    }

    /// Stop a one-shot early
    pub fn cancel_one_shot(&mut self, mixer: &mut Mixer, id: OneShotId) -> bool {
        let Some(index) = self.one_shots.iter().position(|s| s.id == id) else {
            return false;
        };
        if let Some(shot) = self.one_shots.remove(index) {
            shot.release(mixer);
        }
        true
    }

    pub fn cancel_all_one_shots(&mut self, mixer: &mut Mixer) {
        for shot in std::mem::take(&mut self.one_shots) {
            shot.release(mixer);
        }
    }

    pub fn one_shot_count(&self) -> usize {
        self.one_shots.len()
    }

    /// Live one-shot ids, oldest first
    pub fn one_shot_ids(&self) -> Vec<OneShotId> {
        self.one_shots.iter().map(|s| s.id).collect()
    }

    pub(super) fn reap_one_shots(&mut self, mixer: &mut Mixer, ended: &[NodeId]) {
        let (finished, live) = std::mem::take(&mut self.one_shots)
            .into_iter()
            .partition(|s| ended.contains(&s.source));
        self.one_shots = live;
        for shot in finished {
            tracing::trace!("Audio: one-shot {} finished", shot.id);
            shot.release(mixer);
        }
    }
}
