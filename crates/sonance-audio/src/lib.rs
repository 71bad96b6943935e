//! Sonance Audio - Runtime mixing and playback engine
//!
//! Turns declarative audio state from the authoring layer into a live
//! signal graph:
//! - `BufferCache` - decoded PCM keyed by asset id (Kira decoders)
//! - `BusGraph` - named buses with solo/mute resolution and effect chains
//! - `DuckingController` - ref-counted sidechain ducking between buses
//! - `SoundInstanceManager` - per-entity sounds, layers, one-shots, fades, occlusion
//! - `AdaptiveMusicSequencer` - phase-locked stems, intensity tiers, quantized segments
//! - `AudioOutput` - renders all of the above to the device through Kira tracks
//! - `AudioEngine` - owns all of the above; `AudioCommand` is its typed input

pub mod buffer;
pub mod bus;
pub mod command;
pub mod config;
pub mod ducking;
pub mod effect;
pub mod engine;
pub mod graph;
pub mod instance;
pub mod mixer;
pub mod music;
pub mod output;

pub use buffer::{AudioBuffer, BufferCache};
pub use bus::{Bus, BusConfig, BusGraph, FALLBACK_BUS, MASTER_BUS};
pub use command::{AudioCommand, CommandOutcome};
pub use config::{AudioConfig, OutputConfig};
pub use ducking::{DuckingController, DuckingRule};
pub use effect::{EffectDef, EffectFactory, EffectType};
pub use engine::AudioEngine;
pub use instance::{
    InstanceKey, InstanceParams, LayerOptions, OneShotOptions, PlaybackState, SoundInstance,
    SoundInstanceManager, SpatialParams,
};
pub use music::{AdaptiveMusicSequencer, MusicSegment, SequencerState};
pub use output::AudioOutput;
