//! Typed commands from the authoring layer
//!
//! Commands arrive as JSON (or TOML) objects tagged with `"command"`. They
//! are parsed into [`AudioCommand`] up front, so malformed payloads are
//! rejected at the boundary and the engine only ever sees well-typed input.

use crate::bus::BusConfig;
use crate::ducking::DuckingRule;
use crate::effect::EffectDef;
use crate::engine::AudioEngine;
use crate::instance::{InstanceKey, InstanceParams, LayerOptions, OneShotOptions};
use crate::music::MusicSegment;
use serde::{Deserialize, Serialize};
use sonance_core::{EntityId, OneShotId, Result, SonanceError, Vec3};
use std::collections::BTreeMap;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_volume() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AudioCommand {
    // Instances
    CreateInstance {
        entity: EntityId,
        asset_id: String,
        #[serde(default)]
        slot: String,
        #[serde(default)]
        params: InstanceParams,
    },
    DestroyInstance {
        entity: EntityId,
        #[serde(default)]
        slot: String,
    },
    Play {
        entity: EntityId,
        #[serde(default)]
        slot: String,
    },
    Pause {
        entity: EntityId,
        #[serde(default)]
        slot: String,
    },
    Resume {
        entity: EntityId,
        #[serde(default)]
        slot: String,
    },
    Stop {
        entity: EntityId,
        #[serde(default)]
        slot: String,
    },
    SetVolume {
        entity: EntityId,
        #[serde(default)]
        slot: String,
        volume: f32,
    },
    SetPitch {
        entity: EntityId,
        #[serde(default)]
        slot: String,
        pitch: f32,
    },
    UpdatePosition {
        entity: EntityId,
        #[serde(default)]
        slot: String,
        position: Vec3,
    },
    SetInstanceBus {
        entity: EntityId,
        #[serde(default)]
        slot: String,
        bus: String,
    },

    // Layers and one-shots
    AddLayer {
        entity: EntityId,
        slot: String,
        asset_id: String,
        #[serde(default)]
        options: LayerOptions,
    },
    RemoveLayer {
        entity: EntityId,
        slot: String,
    },
    RemoveAllLayers {
        entity: EntityId,
    },
    PlayOneShot {
        asset_id: String,
        #[serde(default)]
        options: OneShotOptions,
    },
    CancelOneShot {
        id: OneShotId,
    },
    CancelAllOneShots,

    // Fades and occlusion
    Crossfade {
        from: InstanceKey,
        to: InstanceKey,
        duration_ms: u64,
    },
    FadeIn {
        key: InstanceKey,
        duration_ms: u64,
    },
    FadeOut {
        key: InstanceKey,
        duration_ms: u64,
        #[serde(default)]
        stop_after: bool,
    },
    SetOcclusion {
        entity: EntityId,
        enabled: bool,
    },
    UpdateOcclusion {
        entity: EntityId,
        occluded: bool,
    },

    // Buses and ducking
    CreateBus {
        name: String,
        #[serde(default = "default_volume")]
        volume: f32,
    },
    DeleteBus {
        name: String,
    },
    SetBusVolume {
        name: String,
        volume: f32,
    },
    MuteBus {
        name: String,
        muted: bool,
    },
    SoloBus {
        name: String,
        soloed: bool,
    },
    SetBusEffects {
        name: String,
        #[serde(default)]
        effects: Vec<EffectDef>,
    },
    ApplyBusConfig {
        buses: Vec<BusConfig>,
    },
    AddDuckingRule(DuckingRule),
    RemoveDuckingRule {
        trigger_bus: String,
        target_bus: String,
    },
    SetListener {
        position: Vec3,
    },

    // Music
    /// Stem name to cached asset id
    LoadStems {
        stems: BTreeMap<String, String>,
    },
    SetIntensity {
        level: f32,
    },
    SetBpm {
        bpm: f32,
    },
    PlayMusic,
    StopMusic,
    SetSegments {
        segments: Vec<MusicSegment>,
    },
    TransitionToSegment {
        name: String,
        #[serde(default = "default_true")]
        quantized: bool,
    },
    MusicCrossfade {
        duration_ms: u64,
    },

    // Global
    StopAll,
    DestroyAll,
}

impl AudioCommand {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SonanceError::InvalidCommand(e.to_string()))
    }

    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| SonanceError::InvalidCommand(e.to_string()))
    }

    /// Parse a JSON array of commands
    pub fn list_from_json(json: &str) -> Result<Vec<Self>> {
        serde_json::from_str(json).map_err(|e| SonanceError::InvalidCommand(e.to_string()))
    }

    /// The `"command"` tag this variant serializes with
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateInstance { .. } => "create_instance",
            Self::DestroyInstance { .. } => "destroy_instance",
            Self::Play { .. } => "play",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Stop { .. } => "stop",
            Self::SetVolume { .. } => "set_volume",
            Self::SetPitch { .. } => "set_pitch",
            Self::UpdatePosition { .. } => "update_position",
            Self::SetInstanceBus { .. } => "set_instance_bus",
            Self::AddLayer { .. } => "add_layer",
            Self::RemoveLayer { .. } => "remove_layer",
            Self::RemoveAllLayers { .. } => "remove_all_layers",
            Self::PlayOneShot { .. } => "play_one_shot",
            Self::CancelOneShot { .. } => "cancel_one_shot",
            Self::CancelAllOneShots => "cancel_all_one_shots",
            Self::Crossfade { .. } => "crossfade",
            Self::FadeIn { .. } => "fade_in",
            Self::FadeOut { .. } => "fade_out",
            Self::SetOcclusion { .. } => "set_occlusion",
            Self::UpdateOcclusion { .. } => "update_occlusion",
            Self::CreateBus { .. } => "create_bus",
            Self::DeleteBus { .. } => "delete_bus",
            Self::SetBusVolume { .. } => "set_bus_volume",
            Self::MuteBus { .. } => "mute_bus",
            Self::SoloBus { .. } => "solo_bus",
            Self::SetBusEffects { .. } => "set_bus_effects",
            Self::ApplyBusConfig { .. } => "apply_bus_config",
            Self::AddDuckingRule(_) => "add_ducking_rule",
            Self::RemoveDuckingRule { .. } => "remove_ducking_rule",
            Self::SetListener { .. } => "set_listener",
            Self::LoadStems { .. } => "load_stems",
            Self::SetIntensity { .. } => "set_intensity",
            Self::SetBpm { .. } => "set_bpm",
            Self::PlayMusic => "play_music",
            Self::StopMusic => "stop_music",
            Self::SetSegments { .. } => "set_segments",
            Self::TransitionToSegment { .. } => "transition_to_segment",
            Self::MusicCrossfade { .. } => "music_crossfade",
            Self::StopAll => "stop_all",
            Self::DestroyAll => "destroy_all",
        }
    }
}

/// What happened when a command ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied,
    /// Valid command that had no effect (missing target, rejected by a cap)
    Ignored,
    OneShotStarted(OneShotId),
}

impl From<bool> for CommandOutcome {
    fn from(applied: bool) -> Self {
        if applied {
            Self::Applied
        } else {
            Self::Ignored
        }
    }
}

impl AudioEngine {
    /// Run a parsed command
    pub fn execute(&mut self, command: AudioCommand) -> CommandOutcome {
        tracing::trace!("Audio: executing {}", command.name());
        match command {
            AudioCommand::CreateInstance {
                entity,
                asset_id,
                slot,
                params,
            } => self.create_instance(entity, &asset_id, &params, &slot).into(),
            AudioCommand::DestroyInstance { entity, slot } => self.destroy_instance(entity, &slot).into(),
            AudioCommand::Play { entity, slot } => self.play(entity, &slot).into(),
            AudioCommand::Pause { entity, slot } => self.pause(entity, &slot).into(),
            AudioCommand::Resume { entity, slot } => self.resume(entity, &slot).into(),
            AudioCommand::Stop { entity, slot } => self.stop(entity, &slot).into(),
            AudioCommand::SetVolume { entity, slot, volume } => self.set_volume(entity, &slot, volume).into(),
            AudioCommand::SetPitch { entity, slot, pitch } => self.set_pitch(entity, &slot, pitch).into(),
            AudioCommand::UpdatePosition {
                entity,
                slot,
                position,
            } => self.update_position(entity, &slot, position).into(),
            AudioCommand::SetInstanceBus { entity, slot, bus } => {
                self.set_instance_bus(entity, &slot, &bus).into()
            }

            AudioCommand::AddLayer {
                entity,
                slot,
                asset_id,
                options,
            } => self.add_layer(entity, &slot, &asset_id, &options).into(),
            AudioCommand::RemoveLayer { entity, slot } => self.remove_layer(entity, &slot).into(),
            AudioCommand::RemoveAllLayers { entity } => (self.remove_all_layers(entity) > 0).into(),
            AudioCommand::PlayOneShot { asset_id, options } => {
                match self.play_one_shot(&asset_id, &options) {
                    Some(id) => CommandOutcome::OneShotStarted(id),
                    None => CommandOutcome::Ignored,
                }
            }
            AudioCommand::CancelOneShot { id } => self.cancel_one_shot(id).into(),
            AudioCommand::CancelAllOneShots => {
                self.cancel_all_one_shots();
                CommandOutcome::Applied
            }

            AudioCommand::Crossfade { from, to, duration_ms } => self
                .crossfade(&from, &to, Duration::from_millis(duration_ms))
                .into(),
            AudioCommand::FadeIn { key, duration_ms } => {
                self.fade_in(&key, Duration::from_millis(duration_ms)).into()
            }
            AudioCommand::FadeOut {
                key,
                duration_ms,
                stop_after,
            } => self
                .fade_out(&key, Duration::from_millis(duration_ms), stop_after)
                .into(),
            AudioCommand::SetOcclusion { entity, enabled } => self.set_occlusion(entity, enabled).into(),
            AudioCommand::UpdateOcclusion { entity, occluded } => {
                self.update_occlusion_state(entity, occluded).into()
            }

            AudioCommand::CreateBus { name, volume } => self.create_bus(&name, volume).into(),
            AudioCommand::DeleteBus { name } => self.delete_bus(&name).into(),
            AudioCommand::SetBusVolume { name, volume } => self.set_bus_volume(&name, volume).into(),
            AudioCommand::MuteBus { name, muted } => self.mute_bus(&name, muted).into(),
            AudioCommand::SoloBus { name, soloed } => self.solo_bus(&name, soloed).into(),
            AudioCommand::SetBusEffects { name, effects } => self.set_bus_effects(&name, &effects).into(),
            AudioCommand::ApplyBusConfig { buses } => {
                self.apply_bus_config(&buses);
                CommandOutcome::Applied
            }
            AudioCommand::AddDuckingRule(rule) => {
                self.add_ducking_rule(rule);
                CommandOutcome::Applied
            }
            AudioCommand::RemoveDuckingRule {
                trigger_bus,
                target_bus,
            } => self.remove_ducking_rule(&trigger_bus, &target_bus).into(),
            AudioCommand::SetListener { position } => {
                self.set_listener(position);
                CommandOutcome::Applied
            }

            AudioCommand::LoadStems { stems } => {
                let pairs = stems.iter().map(|(name, asset)| (name.as_str(), asset.as_str()));
                (self.load_stems_from_cache(pairs) > 0).into()
            }
            AudioCommand::SetIntensity { level } => {
                self.set_intensity(level);
                CommandOutcome::Applied
            }
            AudioCommand::SetBpm { bpm } => {
                self.set_bpm(bpm);
                CommandOutcome::Applied
            }
            AudioCommand::PlayMusic => self.play_music().into(),
            AudioCommand::StopMusic => {
                self.stop_music();
                CommandOutcome::Applied
            }
            AudioCommand::SetSegments { segments } => {
                self.set_segments(segments);
                CommandOutcome::Applied
            }
            AudioCommand::TransitionToSegment { name, quantized } => {
                self.transition_to_segment(&name, quantized).into()
            }
            AudioCommand::MusicCrossfade { duration_ms } => {
                self.music_crossfade(Duration::from_millis(duration_ms));
                CommandOutcome::Applied
            }

            AudioCommand::StopAll => {
                self.stop_all();
                CommandOutcome::Applied
            }
            AudioCommand::DestroyAll => {
                self.destroy_all();
                CommandOutcome::Applied
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AudioBuffer;
    use crate::config::AudioConfig;
    use sonance_core::ManualClock;
    use std::sync::Arc;

    fn engine() -> AudioEngine {
        let mut engine =
            AudioEngine::with_clock(AudioConfig::default(), Arc::new(ManualClock::new()));
        engine.insert_buffer("step", AudioBuffer::silent(48_000, 0.5));
        engine
    }

    #[test]
    fn test_parse_create_instance_with_defaults() {
        let json = r#"{
            "command": "create_instance",
            "entity": 7,
            "assetId": "step",
            "params": { "volume": 0.5, "loop": true, "spatial": { "position": [1.0, 2.0, 3.0] } }
        }"#;
        let command = AudioCommand::from_json(json).unwrap();
        let AudioCommand::CreateInstance {
            entity,
            slot,
            params,
            ..
        } = command
        else {
            panic!("wrong variant");
        };
        assert_eq!(entity, EntityId(7));
        assert_eq!(slot, "");
        assert!(params.looping);
        assert_eq!(params.bus, "sfx");
        let spatial = params.spatial.unwrap();
        assert_eq!(spatial.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(spatial.max_distance, 25.0);
    }

    #[test]
    fn test_parse_rejects_bad_payloads() {
        assert!(matches!(
            AudioCommand::from_json(r#"{"command":"explode"}"#),
            Err(SonanceError::InvalidCommand(_))
        ));
        assert!(AudioCommand::from_json(r#"{"command":"set_volume","entity":1}"#).is_err());
        assert!(AudioCommand::from_json(r#"{"command":"play","entity":"one"}"#).is_err());
    }

    #[test]
    fn test_parse_toml_and_tagged_rule() {
        let command = AudioCommand::from_toml(
            r#"
            command = "transition_to_segment"
            name = "combat"
            "#,
        )
        .unwrap();
        assert_eq!(
            command,
            AudioCommand::TransitionToSegment {
                name: "combat".into(),
                quantized: true
            }
        );

        let rule = AudioCommand::from_json(
            r#"{"command":"add_ducking_rule","triggerBus":"sfx","targetBus":"ambient","duckLevel":0.5}"#,
        )
        .unwrap();
        assert_eq!(rule.name(), "add_ducking_rule");
        match rule {
            AudioCommand::AddDuckingRule(rule) => {
                assert_eq!(rule.trigger_bus, "sfx");
                assert_eq!(rule.release_ms, 500.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_execute_sequence() {
        let mut engine = engine();
        let commands = AudioCommand::list_from_json(
            r#"[
                {"command":"create_bus","name":"ui"},
                {"command":"create_instance","entity":1,"assetId":"step","params":{"bus":"ui"}},
                {"command":"play","entity":1},
                {"command":"mute_bus","name":"ui","muted":true},
                {"command":"delete_bus","name":"ui"}
            ]"#,
        )
        .unwrap();
        for command in commands {
            assert_eq!(engine.execute(command), CommandOutcome::Applied);
        }
        assert!(engine.is_playing(EntityId(1), ""));
        assert_eq!(
            engine.sounds().get(&InstanceKey::primary(EntityId(1))).unwrap().bus,
            "sfx"
        );

        let missing = AudioCommand::Stop {
            entity: EntityId(9),
            slot: String::new(),
        };
        assert_eq!(engine.execute(missing), CommandOutcome::Ignored);
    }

    #[test]
    fn test_execute_one_shot() {
        let mut engine = engine();
        let command =
            AudioCommand::from_json(r#"{"command":"play_one_shot","assetId":"step"}"#).unwrap();
        let CommandOutcome::OneShotStarted(id) = engine.execute(command) else {
            panic!("one-shot did not start");
        };
        assert_eq!(engine.execute(AudioCommand::CancelOneShot { id }), CommandOutcome::Applied);
        assert_eq!(engine.execute(AudioCommand::CancelOneShot { id }), CommandOutcome::Ignored);
    }
}
