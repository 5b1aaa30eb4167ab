//! Pipeline configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::output::UnderrunPolicy;

/// Channels carried by the transport (the engine renders stereo).
pub const TRANSPORT_CHANNELS: usize = 2;

/// Tuning and start-up parameters for a [`Pipeline`](crate::Pipeline).
///
/// The defaults match a 48 kHz device: 128-frame blocks, 1024 frames (~21 ms)
/// of look-ahead in a 4096-frame buffer.
///
/// ```
/// use synthbridge::PipelineConfig;
///
/// let config = PipelineConfig::default()
///     .with_block_size(64)
///     .with_target_ahead_frames(512)
///     .with_initial_volume(0.8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// `None` takes the output device's rate. A rate that differs from the
    /// device's fails `init`.
    pub sample_rate: Option<u32>,
    /// Frames per engine render call.
    pub block_size: usize,
    /// Frames the worker keeps buffered ahead of the output.
    pub target_ahead_frames: usize,
    /// Audio stream buffer size in frames, a power of two.
    pub capacity_frames: usize,
    /// Control queue size in bytes, a power of two.
    pub control_capacity_bytes: usize,
    /// Note-offs that always fit in the control queue.
    pub note_off_reserve: usize,
    /// Out-of-band worker commands (volume, presets) in flight.
    pub command_capacity: usize,
    pub initial_volume: f32,
    pub preset: Option<Vec<u8>>,
    /// How long the worker sleeps when it is ahead or out of room.
    pub poll_interval: Duration,
    /// Largest quantum the output callback serves with a single read.
    pub max_quantum_frames: usize,
    pub underrun_policy: UnderrunPolicy,
    /// Skip the dual-context transport and use the fallback.
    pub force_single_context: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: None,
            block_size: 128,
            target_ahead_frames: 1024,
            capacity_frames: 4096,
            control_capacity_bytes: 1024,
            note_off_reserve: 16,
            command_capacity: 64,
            initial_volume: 1.0,
            preset: None,
            poll_interval: Duration::from_millis(1),
            max_quantum_frames: 4096,
            underrun_policy: UnderrunPolicy::Silence,
            force_single_context: false,
        }
    }
}

impl PipelineConfig {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn with_block_size(mut self, frames: usize) -> Self {
        self.block_size = frames;
        self
    }

    pub fn with_target_ahead_frames(mut self, frames: usize) -> Self {
        self.target_ahead_frames = frames;
        self
    }

    pub fn with_capacity_frames(mut self, frames: usize) -> Self {
        self.capacity_frames = frames;
        self
    }

    pub fn with_control_capacity(mut self, bytes: usize, note_off_reserve: usize) -> Self {
        self.control_capacity_bytes = bytes;
        self.note_off_reserve = note_off_reserve;
        self
    }

    pub fn with_initial_volume(mut self, level: f32) -> Self {
        self.initial_volume = level;
        self
    }

    pub fn with_preset(mut self, payload: Vec<u8>) -> Self {
        self.preset = Some(payload);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_underrun_policy(mut self, policy: UnderrunPolicy) -> Self {
        self.underrun_policy = policy;
        self
    }

    pub fn force_single_context(mut self) -> Self {
        self.force_single_context = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.sample_rate == Some(0) {
            return invalid("sample rate must be non-zero".into());
        }
        if self.block_size == 0 {
            return invalid("block size must be non-zero".into());
        }
        if !self.capacity_frames.is_power_of_two() {
            return invalid(format!("capacity {} is not a power of two", self.capacity_frames));
        }
        if self.target_ahead_frames + self.block_size > self.capacity_frames {
            return invalid(format!(
                "target look-ahead {} plus one block of {} exceeds capacity {}",
                self.target_ahead_frames, self.block_size, self.capacity_frames
            ));
        }
        if !self.control_capacity_bytes.is_power_of_two() {
            return invalid(format!(
                "control capacity {} is not a power of two",
                self.control_capacity_bytes
            ));
        }
        if self.note_off_reserve * 3 >= self.control_capacity_bytes {
            return invalid("note-off reserve leaves no room for note-ons".into());
        }
        if self.command_capacity == 0 || self.max_quantum_frames == 0 {
            return invalid("command capacity and max quantum must be non-zero".into());
        }
        if !(0.0..=1.0).contains(&self.initial_volume) {
            return invalid(format!("initial volume {} outside 0.0..=1.0", self.initial_volume));
        }
        Ok(())
    }
}
