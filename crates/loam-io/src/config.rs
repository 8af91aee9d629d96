//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use loam_core::{CompileOptions, ProcessContext, ProcessingMode};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Settings shared by offline renders and realtime sessions.
///
/// Every field has a default, so a TOML file only needs the values it changes:
///
/// ```toml
/// sample_rate = 44100
/// block_size = 128
/// wav_bits = 16
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per block.
    pub block_size: usize,
    /// Output channels.
    pub channels: u16,
    /// Constant tempo used for beat positions.
    pub tempo_bpm: f64,
    /// Events each MIDI or trigger buffer holds per block.
    pub event_capacity: usize,
    /// Longest compensation delay line the compiler may allocate.
    pub max_compensation_samples: u64,
    /// How often the realtime latency worker checks for changes.
    pub latency_poll_ms: u64,
    /// WAV output bit depth: 16 (integer PCM) or 32 (float).
    pub wav_bits: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 256,
            channels: 2,
            tempo_bpm: 120.0,
            event_capacity: loam_core::DEFAULT_EVENT_CAPACITY,
            max_compensation_samples: loam_core::DEFAULT_MAX_COMPENSATION,
            latency_poll_ms: 10,
            wav_bits: 32,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Serializes to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));
        if self.sample_rate == 0 {
            return invalid("sample_rate must be non-zero");
        }
        if self.block_size == 0 {
            return invalid("block_size must be non-zero");
        }
        if self.channels == 0 {
            return invalid("channels must be non-zero");
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be non-zero");
        }
        if self.latency_poll_ms == 0 {
            return invalid("latency_poll_ms must be non-zero");
        }
        if !(self.tempo_bpm.is_finite() && self.tempo_bpm > 0.0) {
            return invalid("tempo_bpm must be positive");
        }
        if !matches!(self.wav_bits, 16 | 32) {
            return Err(Error::InvalidConfig(format!(
                "wav_bits must be 16 or 32, got {}",
                self.wav_bits
            )));
        }
        Ok(())
    }

    /// Compiler settings derived from this config.
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions::new(self.block_size)
            .with_event_capacity(self.event_capacity)
            .with_max_compensation(self.max_compensation_samples)
    }

    /// A fresh context at position zero.
    pub fn process_context(&self, mode: ProcessingMode) -> ProcessContext {
        ProcessContext::new(self.sample_rate, self.block_size)
            .with_mode(mode)
            .with_tempo(self.tempo_bpm)
    }

    /// Realtime block deadline in nanoseconds.
    pub fn block_deadline_ns(&self) -> u64 {
        (self.block_size as u64 * 1_000_000_000) / u64::from(self.sample_rate.max(1))
    }

    /// Poll interval of the latency worker.
    pub fn latency_poll_interval(&self) -> Duration {
        Duration::from_millis(self.latency_poll_ms)
    }

    /// Frames covering `duration`, rounded up.
    pub fn frames_for(&self, duration: Duration) -> u64 {
        let frames = duration.as_nanos() * u128::from(self.sample_rate);
        frames.div_ceil(1_000_000_000) as u64
    }
}
