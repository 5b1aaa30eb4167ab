//! Plays an arpeggio on the default output device.
//!
//! Run with: cargo run --example arpeggio --features cpal_sink

use std::thread::sleep;
use std::time::Duration;

use synthbridge::{CpalOutput, Pipeline, PipelineConfig, PolySynth, Preset, Waveform};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let output = CpalOutput::default_output().ok_or("No audio device")?;
    println!("Output: {}", output.name());

    let preset = Preset {
        waveform: Waveform::Saw,
        attack: 0.01,
        release: 0.3,
        gain: 0.2,
    };
    let config = PipelineConfig::default()
        .with_initial_volume(0.8)
        .with_preset(preset.to_bytes());

    let mut pipeline = Pipeline::new(config, output, PolySynth::factory());
    let backend = pipeline.init()?;
    println!("Backend: {}", backend);
    pipeline.resume_output()?;

    for round in 0..4 {
        for note in [57u8, 60, 64, 69, 72, 69, 64, 60] {
            pipeline.note_on(note + round * 2, 0.8)?;
            sleep(Duration::from_millis(150));
            pipeline.note_off(note + round * 2)?;
        }
    }
    sleep(Duration::from_millis(500));

    println!("Underruns: {}", pipeline.underrun_count());
    pipeline.destroy();
    Ok(())
}
