//! The synthesis engine seam.
//!
//! The transport treats the engine as opaque: it forwards note events, volume
//! and preset payloads, and asks for fixed-size stereo blocks. Whatever sits
//! behind the trait (native DSP, a plugin, [`PolySynth`](crate::synth::PolySynth))
//! is owned by exactly one context at a time.

use crate::error::EngineError;

/// Parameters an engine is constructed with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Frames per [`SynthEngine::render`] call.
    pub block_size: usize,
}

/// A synthesis engine driven block by block.
pub trait SynthEngine: Send + 'static {
    /// `velocity` is MIDI-style, `0..=127`.
    fn note_on(&mut self, note: u8, velocity: u8);

    fn note_off(&mut self, note: u8);

    /// `level` is linear gain in `0.0..=1.0`.
    fn set_volume(&mut self, level: f32);

    /// Replaces the engine configuration.
    ///
    /// On error the engine must keep its previous configuration and voices.
    fn load_preset(&mut self, payload: &[u8]) -> Result<(), EngineError>;

    /// Renders one block. Both slices have the same length, at most the
    /// configured block size.
    fn render(&mut self, left: &mut [f32], right: &mut [f32]) -> Result<(), EngineError>;
}

/// Builds the engine inside whichever context ends up owning it.
pub type EngineFactory =
    Box<dyn FnOnce(&EngineConfig) -> Result<Box<dyn SynthEngine>, EngineError> + Send + 'static>;

/// Converts an API velocity in `0.0..=1.0` to the record's `0..=127`.
#[inline]
pub fn velocity_to_midi(velocity: f32) -> u8 {
    if velocity.is_nan() {
        return 0;
    }
    (velocity.clamp(0.0, 1.0) * 127.0).round() as u8
}
