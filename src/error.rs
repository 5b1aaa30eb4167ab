//! Error types for the transport and the synthesis engine.

use thiserror::Error;

use crate::pipeline::PipelineState;

/// Errors reported by a [`SynthEngine`](crate::SynthEngine).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The engine could not be constructed.
    #[error("engine init: {0}")]
    Init(String),

    /// A preset payload was malformed or could not be decoded.
    #[error("preset: {0}")]
    Preset(String),

    /// The engine failed while rendering a block.
    #[error("render: {0}")]
    Render(String),
}

/// Errors surfaced by the pipeline to the calling collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The host cannot provide shared memory or a real-time output context.
    /// Recovered internally by switching to the single-context fallback.
    #[error("environment unsupported: {0}")]
    EnvironmentUnsupported(String),

    /// One of the two contexts did not acknowledge during bring-up.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// The control queue has no room for the record.
    #[error("control queue full")]
    ControlQueueOverflow,

    /// The synthesis engine reported an internal error.
    #[error("engine failure: {0}")]
    EngineFailure(String),

    /// A preset payload was rejected. The previous engine state is intact.
    #[error("preset load failed: {0}")]
    PresetLoadFailure(String),

    /// The output device failed.
    #[error("output: {0}")]
    Output(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("note {0} out of range 0..=127")]
    InvalidNote(u8),

    /// The operation needs a running pipeline.
    #[error("pipeline is not running (state: {0:?})")]
    NotRunning(PipelineState),
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Preset(msg) => Error::PresetLoadFailure(msg),
            other => Error::EngineFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
