//! Buffer cache: decoded PCM keyed by asset id
//!
//! Decoding goes through Kira's static sound loader, so every format Kira is
//! built with (ogg, wav, ...) is accepted. Buffers are immutable once stored
//! and shared read-only through `Arc`.

use kira::sound::static_sound::{StaticSoundData, StaticSoundSettings};
use kira::Frame;
use sonance_core::{Result, SonanceError};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

/// Decoded stereo PCM
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    sample_rate: u32,
    frames: Arc<[Frame]>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, frames: impl Into<Arc<[Frame]>>) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frames: frames.into(),
        }
    }

    /// A buffer of silence, mostly useful for hosts without assets and for tests
    pub fn silent(sample_rate: u32, seconds: f64) -> Self {
        let len = (sample_rate as f64 * seconds.max(0.0)).round() as usize;
        Self::new(sample_rate, vec![Frame::ZERO; len])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Playback length in seconds at a playback rate of 1.0
    pub fn duration(&self) -> f64 {
        self.frames.len() as f64 / self.sample_rate as f64
    }

    /// Kira sound data sharing these frames, ready to play on a track
    pub fn sound_data(&self) -> StaticSoundData {
        StaticSoundData {
            sample_rate: self.sample_rate,
            frames: self.frames.clone(),
            settings: StaticSoundSettings::default(),
            slice: None,
        }
    }

    fn from_sound_data(data: StaticSoundData) -> Self {
        Self::new(data.sample_rate, data.frames)
    }
}

/// Stores decoded audio buffers by asset id
#[derive(Debug, Default)]
pub struct BufferCache {
    buffers: HashMap<String, Arc<AudioBuffer>>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an encoded byte payload and store it under `asset_id`.
    ///
    /// On failure nothing is stored and the decode error is returned.
    pub fn load_buffer(&mut self, asset_id: &str, bytes: Vec<u8>) -> Result<()> {
        let data = StaticSoundData::from_cursor(Cursor::new(bytes)).map_err(|e| {
            SonanceError::Decode {
                asset: asset_id.to_string(),
                reason: e.to_string(),
            }
        })?;

        self.insert(asset_id, AudioBuffer::from_sound_data(data));
        Ok(())
    }

    /// Decode a sound file from disk and store it under `asset_id`
    pub fn load_file(&mut self, asset_id: &str, path: &Path) -> Result<()> {
        if self.buffers.contains_key(asset_id) {
            return Ok(());
        }

        let data = StaticSoundData::from_file(path).map_err(|e| SonanceError::Decode {
            asset: asset_id.to_string(),
            reason: format!("failed to load '{}': {}", path.display(), e),
        })?;

        self.insert(asset_id, AudioBuffer::from_sound_data(data));
        Ok(())
    }

    /// Store already-decoded PCM, replacing any previous buffer for the id
    pub fn insert(&mut self, asset_id: &str, buffer: AudioBuffer) {
        self.buffers.insert(asset_id.to_string(), Arc::new(buffer));
    }

    pub fn get(&self, asset_id: &str) -> Option<Arc<AudioBuffer>> {
        self.buffers.get(asset_id).cloned()
    }

    pub fn contains(&self, asset_id: &str) -> bool {
        self.buffers.contains_key(asset_id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drop every buffer. Instances already holding a buffer keep it alive.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
