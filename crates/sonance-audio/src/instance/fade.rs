//! Crossfades and single-sided fades between instances
//!
//! Ramps are scheduled on the gain nodes from a single `now`. Stops that
//! must wait for a ramp to finish are queued and executed by
//! [`SoundInstanceManager::run_pending_stops`] from the engine's update.

use super::{InstanceKey, SoundInstanceManager};
use crate::mixer::Mixer;
use std::time::Duration;

/// An instance to stop once its fade-out ramp has finished
#[derive(Debug, Clone)]
pub(super) struct PendingStop {
    pub at: f64,
    pub key: InstanceKey,
}

impl SoundInstanceManager {
    /// Fade `from` out and `to` in over the same window.
    ///
    /// `from` is stopped when its ramp completes; `to` is started if it was
    /// not already playing and rises from silence to its own volume.
    pub fn crossfade(
        &mut self,
        mixer: &mut Mixer,
        from: &InstanceKey,
        to: &InstanceKey,
        duration: Duration,
    ) -> bool {
        if !self.contains(from) || !self.contains(to) {
            tracing::warn!("Audio: crossfade between missing instances {from:?} -> {to:?}");
            return false;
        }

        let now = mixer.now();
        let seconds = duration.as_secs_f64();

        if let Some(instance) = self.instances.get(from) {
            if let Some(gain) = mixer.graph.gain_param_mut(instance.gain) {
                gain.ramp_to(0.0, now, seconds);
            }
        }
        self.schedule_stop(from, now + seconds);

        self.rise_from_silence(mixer, to, now, seconds);
        true
    }

    /// Start (if needed) and ramp from silence up to the instance's volume
    pub fn fade_in(&mut self, mixer: &mut Mixer, key: &InstanceKey, duration: Duration) -> bool {
        if !self.contains(key) {
            tracing::warn!("Audio: fade_in on missing instance {key:?}");
            return false;
        }
        let now = mixer.now();
        self.rise_from_silence(mixer, key, now, duration.as_secs_f64());
        true
    }

    /// Ramp to silence, optionally stopping once the ramp has finished
    pub fn fade_out(
        &mut self,
        mixer: &mut Mixer,
        key: &InstanceKey,
        duration: Duration,
        stop_after: bool,
    ) -> bool {
        let Some(instance) = self.instances.get(key) else {
            tracing::warn!("Audio: fade_out on missing instance {key:?}");
            return false;
        };
        let now = mixer.now();
        let seconds = duration.as_secs_f64();
        if let Some(gain) = mixer.graph.gain_param_mut(instance.gain) {
            gain.ramp_to(0.0, now, seconds);
        }
        if stop_after {
            self.schedule_stop(key, now + seconds);
        }
        true
    }

    /// Stop every instance whose fade-out has finished. Stopping restores
    /// the gain to the stored volume for the next play.
    pub fn run_pending_stops(&mut self, mixer: &mut Mixer) {
        let now = mixer.now();
        let (due, waiting): (Vec<PendingStop>, Vec<PendingStop>) = std::mem::take(&mut self.pending_stops)
            .into_iter()
            .partition(|p| p.at <= now);
        self.pending_stops = waiting;

        for pending in due {
            self.stop(mixer, &pending.key);
        }
    }

    pub fn pending_stop_count(&self) -> usize {
        self.pending_stops.len()
    }

    pub(super) fn cancel_pending_stop(&mut self, key: &InstanceKey) {
        self.pending_stops.retain(|p| &p.key != key);
    }

    fn schedule_stop(&mut self, key: &InstanceKey, at: f64) {
        self.cancel_pending_stop(key);
        self.pending_stops.push(PendingStop {
            at,
            key: key.clone(),
        });
    }

    fn rise_from_silence(&mut self, mixer: &mut Mixer, key: &InstanceKey, now: f64, seconds: f64) {
        if !self.is_playing(key) {
            self.play(mixer, key);
        } else {
            self.cancel_pending_stop(key);
        }
        if let Some(instance) = self.instances.get(key) {
            if let Some(gain) = mixer.graph.gain_param_mut(instance.gain) {
                gain.ramp_between(0.0, instance.volume, now, seconds);
            }
        }
    }
}
