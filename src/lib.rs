//! Low-latency audio transport between a synthesis worker and a real-time
//! output callback.
//!
//! A [`Pipeline`] runs a [`SynthEngine`] on a worker thread that renders ahead
//! into a lock-free [`AudioStreamBuffer`], while the device's output callback
//! drains it one quantum at a time. Note events reach the worker through a
//! [`ControlQueue`]. When the host cannot run two contexts the pipeline falls
//! back to rendering inside the output callback, behind the same API.
//!
//! ```
//! use synthbridge::{OfflineOutput, Pipeline, PipelineConfig, PipelineState, PolySynth};
//!
//! let (output, clock) = OfflineOutput::new(48_000, 2);
//! let mut pipeline = Pipeline::new(PipelineConfig::default(), output, PolySynth::factory());
//! pipeline.init().unwrap();
//! pipeline.resume_output().unwrap();
//! assert_eq!(pipeline.state(), PipelineState::Ready);
//!
//! pipeline.note_on(69, 0.8).unwrap();
//! let quantum = clock.pull(256);
//! assert_eq!(quantum.len(), 512);
//! ```

mod region;

pub mod audio_buffer;
pub mod config;
pub mod control_queue;
#[cfg(feature = "cpal_sink")]
pub mod cpal_output;
pub mod device;
pub mod engine;
pub mod error;
mod fallback;
pub mod output;
pub mod pipeline;
pub mod synth;
pub mod worker;

pub use audio_buffer::{AudioReader, AudioStreamBuffer, AudioWriter};
pub use config::{PipelineConfig, TRANSPORT_CHANNELS};
pub use control_queue::{ControlConsumer, ControlProducer, ControlQueue, ControlRecord};
#[cfg(feature = "cpal_sink")]
pub use cpal_output::CpalOutput;
pub use device::{AudioOutput, HostCapabilities, OfflineClock, OfflineOutput, RenderCallback};
pub use engine::{velocity_to_midi, EngineConfig, EngineFactory, SynthEngine};
pub use error::{EngineError, Error, Result};
pub use output::{OutputCallback, TransportStats, UnderrunPolicy};
pub use pipeline::{BackendKind, Pipeline, PipelineEvent, PipelineState};
pub use synth::{PolySynth, Preset, Waveform};
pub use worker::{Step, SynthesisWorker};
