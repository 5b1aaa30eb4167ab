//! A small polyphonic synth, the default [`SynthEngine`].
//!
//! Presets are UTF-8 text, one `key = value` per line, `#` comments, and a
//! closing `end` line so a truncated payload is always detected:
//!
//! ```text
//! waveform = square
//! attack = 0.005
//! release = 0.3
//! gain = 0.4
//! end
//! ```

use core::fmt;

use crate::engine::{EngineConfig, SynthEngine};
use crate::error::EngineError;

const MAX_VOICES: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Saw,
}

impl Waveform {
    /// One sample at `phase` in `0.0..1.0`.
    #[inline]
    fn sample(self, phase: f32) -> f32 {
        match self {
            Waveform::Sine => (phase * core::f32::consts::TAU).sin(),
            Waveform::Square => 1.0_f32.copysign(0.5 - phase),
            Waveform::Saw => 2.0 * phase - 1.0,
        }
    }
}

/// Engine configuration carried by a preset payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Preset {
    pub waveform: Waveform,
    /// Seconds from silence to full level.
    pub attack: f32,
    /// Seconds from full level to silence.
    pub release: f32,
    pub gain: f32,
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            attack: 0.005,
            release: 0.2,
            gain: 0.25, // -12dB, safe default
        }
    }
}

impl Preset {
    /// Parses a preset payload. Keys missing from the payload keep their defaults.
    pub fn parse(payload: &[u8]) -> Result<Self, EngineError> {
        let text = core::str::from_utf8(payload)
            .map_err(|e| EngineError::Preset(format!("payload is not UTF-8: {}", e)))?;

        let mut preset = Preset::default();
        let mut terminated = false;

        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if terminated {
                return Err(EngineError::Preset(format!("line {}: content after `end`", n + 1)));
            }
            if line == "end" {
                terminated = true;
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| EngineError::Preset(format!("line {}: expected `key = value`", n + 1)))?;
            let value = value.trim();
            match key.trim() {
                "waveform" => {
                    preset.waveform = match value {
                        "sine" => Waveform::Sine,
                        "square" => Waveform::Square,
                        "saw" => Waveform::Saw,
                        other => {
                            return Err(EngineError::Preset(format!(
                                "line {}: unknown waveform `{}`",
                                n + 1,
                                other
                            )))
                        }
                    }
                }
                "attack" => preset.attack = parse_number(n, value, 0.0, 10.0)?,
                "release" => preset.release = parse_number(n, value, 0.0, 10.0)?,
                "gain" => preset.gain = parse_number(n, value, 0.0, 1.0)?,
                other => {
                    return Err(EngineError::Preset(format!("line {}: unknown key `{}`", n + 1, other)))
                }
            }
        }

        if !terminated {
            return Err(EngineError::Preset("truncated preset: missing `end`".into()));
        }
        Ok(preset)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let waveform = match self.waveform {
            Waveform::Sine => "sine",
            Waveform::Square => "square",
            Waveform::Saw => "saw",
        };
        writeln!(f, "waveform = {}", waveform)?;
        writeln!(f, "attack = {}", self.attack)?;
        writeln!(f, "release = {}", self.release)?;
        writeln!(f, "gain = {}", self.gain)?;
        writeln!(f, "end")
    }
}

fn parse_number(line: usize, value: &str, min: f32, max: f32) -> Result<f32, EngineError> {
    let v: f32 = value
        .parse()
        .map_err(|_| EngineError::Preset(format!("line {}: `{}` is not a number", line + 1, value)))?;
    if !v.is_finite() || v < min || v > max {
        return Err(EngineError::Preset(format!(
            "line {}: {} outside {}..={}",
            line + 1,
            v,
            min,
            max
        )));
    }
    Ok(v)
}

#[derive(Clone, Copy, Default)]
struct Voice {
    note: u8,
    velocity: f32,
    phase: f32,
    phase_inc: f32,
    level: f32,
    releasing: bool,
    active: bool,
}

/// Polyphonic oscillator bank with linear attack/release and smoothed volume.
pub struct PolySynth {
    sample_rate: f32,
    voices: [Voice; MAX_VOICES],
    preset: Preset,
    volume: f32,
    smoothed_volume: f32,
    /// Smoothing coefficient (0.0 = instant, 1.0 = no change)
    smooth_coeff: f32,
}

impl PolySynth {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate as f32,
            voices: [Voice::default(); MAX_VOICES],
            preset: Preset::default(),
            volume: 1.0,
            smoothed_volume: 1.0,
            smooth_coeff: 0.995, // ~7ms at 48kHz
        }
    }

    /// Boxed constructor matching [`EngineFactory`](crate::EngineFactory).
    pub fn factory() -> crate::engine::EngineFactory {
        Box::new(|config: &EngineConfig| -> Result<Box<dyn SynthEngine>, EngineError> {
            if config.sample_rate == 0 {
                return Err(EngineError::Init("sample rate must be non-zero".into()));
            }
            Ok(Box::new(PolySynth::new(config)))
        })
    }

    pub fn preset(&self) -> &Preset {
        &self.preset
    }

    /// Voices currently producing sound, including releasing ones.
    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.active).count()
    }

    fn step(&self, seconds: f32) -> f32 {
        if seconds <= 0.0 {
            1.0
        } else {
            1.0 / (seconds * self.sample_rate)
        }
    }
}

impl SynthEngine for PolySynth {
    fn note_on(&mut self, note: u8, velocity: u8) {
        if velocity == 0 {
            self.note_off(note);
            return;
        }

        let freq = 440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0);
        let phase_inc = freq / self.sample_rate;

        let slot = self
            .voices
            .iter()
            .position(|v| v.active && v.note == note)
            .or_else(|| self.voices.iter().position(|v| !v.active))
            .unwrap_or_else(|| {
                // steal the quietest voice
                let mut quietest = 0;
                for (i, v) in self.voices.iter().enumerate() {
                    if v.level < self.voices[quietest].level {
                        quietest = i;
                    }
                }
                quietest
            });

        let voice = &mut self.voices[slot];
        let retrigger = voice.active && voice.note == note;
        *voice = Voice {
            note,
            velocity: velocity as f32 / 127.0,
            phase: if retrigger { voice.phase } else { 0.0 },
            phase_inc,
            level: if retrigger { voice.level } else { 0.0 },
            releasing: false,
            active: true,
        };
    }

    fn note_off(&mut self, note: u8) {
        for voice in self.voices.iter_mut().filter(|v| v.active && v.note == note) {
            voice.releasing = true;
        }
    }

    fn set_volume(&mut self, level: f32) {
        self.volume = level.clamp(0.0, 1.0);
    }

    fn load_preset(&mut self, payload: &[u8]) -> Result<(), EngineError> {
        // parse fully before touching any state
        self.preset = Preset::parse(payload)?;
        Ok(())
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) -> Result<(), EngineError> {
        if left.len() != right.len() {
            return Err(EngineError::Render(format!(
                "channel length mismatch: {} vs {}",
                left.len(),
                right.len()
            )));
        }

        let attack_step = self.step(self.preset.attack);
        let release_step = self.step(self.preset.release);
        let waveform = self.preset.waveform;
        let gain = self.preset.gain;
        let target_volume = self.volume;
        let smooth_coeff = self.smooth_coeff;
        let mut volume = self.smoothed_volume;

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let mut sum = 0.0;
            for voice in self.voices.iter_mut().filter(|v| v.active) {
                if voice.releasing {
                    voice.level -= release_step;
                    if voice.level <= 0.0 {
                        voice.active = false;
                        voice.level = 0.0;
                        continue;
                    }
                } else if voice.level < 1.0 {
                    voice.level = (voice.level + attack_step).min(1.0);
                }

                sum += waveform.sample(voice.phase) * voice.level * voice.velocity;

                voice.phase += voice.phase_inc;
                // Branchless phase wrap (phase is always positive)
                voice.phase -= (voice.phase >= 1.0) as u32 as f32;
            }

            volume = target_volume + smooth_coeff * (volume - target_volume);
            let out = sum * gain * volume;
            *l = out;
            *r = out;
        }

        self.smoothed_volume = volume;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth() -> PolySynth {
        PolySynth::new(&EngineConfig {
            sample_rate: 48_000,
            block_size: 128,
        })
    }

    fn block(s: &mut PolySynth) -> Vec<f32> {
        let mut l = vec![0.0; 128];
        let mut r = vec![0.0; 128];
        s.render(&mut l, &mut r).unwrap();
        assert_eq!(l, r);
        l
    }

    fn peak(samples: &[f32]) -> f32 {
        samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn silent_until_a_note_is_played() {
        let mut s = synth();
        assert_eq!(peak(&block(&mut s)), 0.0);
        s.note_on(69, 100);
        block(&mut s);
        assert!(peak(&block(&mut s)) > 0.01);
    }

    #[test]
    fn released_voices_fade_out_and_free_up() {
        let mut s = synth();
        s.load_preset(b"release = 0.001\nend\n").unwrap();
        s.note_on(60, 127);
        block(&mut s);
        s.note_off(60);
        for _ in 0..4 {
            block(&mut s);
        }
        assert_eq!(s.active_voices(), 0);
        assert_eq!(peak(&block(&mut s)), 0.0);
    }

    #[test]
    fn voices_are_stolen_when_all_are_busy() {
        let mut s = synth();
        for note in 0..(MAX_VOICES as u8 + 4) {
            s.note_on(40 + note, 100);
        }
        assert_eq!(s.active_voices(), MAX_VOICES);
    }

    #[test]
    fn preset_round_trips_through_text() {
        let preset = Preset {
            waveform: Waveform::Saw,
            attack: 0.25,
            release: 1.5,
            gain: 0.75,
        };
        assert_eq!(Preset::parse(&preset.to_bytes()).unwrap(), preset);
    }

    #[test]
    fn malformed_presets_are_rejected_and_state_is_kept() {
        let mut s = synth();
        s.load_preset(b"waveform = square\nend\n").unwrap();
        s.note_on(64, 90);

        let bad_payloads: [&[u8]; 8] = [
            b"waveform = square\ngain = 0.5\n", // truncated, no `end`
            b"waveform = squ",
            b"waveform = triangle\nend\n",
            b"gain = 2.0\nend\n",
            b"gain = loud\nend\n",
            b"volume = 1\nend\n",
            b"end\nattack = 0.1\n",
            b"\xff\xfe",
        ];
        for bad in bad_payloads {
            assert!(matches!(s.load_preset(bad), Err(EngineError::Preset(_))), "{:?}", bad);
        }

        assert_eq!(s.preset().waveform, Waveform::Square);
        assert_eq!(s.active_voices(), 1);
    }

    #[test]
    fn mismatched_channels_fail_to_render() {
        let mut s = synth();
        let mut l = vec![0.0; 64];
        let mut r = vec![0.0; 32];
        assert!(matches!(s.render(&mut l, &mut r), Err(EngineError::Render(_))));
    }
}
