//! Sonance Core - Foundational types for the Sonance audio engine
//!
//! This crate provides the types every other Sonance crate depends on:
//! - `EntityId`, `OneShotId` - identifiers handed out to the authoring layer
//! - `Clock` - the audio clock abstraction (`SystemClock`, `ManualClock`)
//! - `Vec3` - spatial positions (glam)
//! - Error types and Result alias

mod clock;
mod error;
mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SonanceError};
pub use glam::Vec3;
pub use id::{EntityId, OneShotId};
