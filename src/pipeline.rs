//! Pipeline orchestration: bring-up, backend selection, control API, teardown.
//!
//! ```text
//! Uninitialized -> Initializing -> Ready    -> Error | Closed
//!                               -> Degraded -> Error | Closed
//! ```
//!
//! `Ready` runs the dual-context transport: a worker thread renders into the
//! audio stream buffer and the device callback drains it. `Degraded` renders
//! synchronously inside the device callback. Both are driven through the same
//! backend interface, so the control API never branches on the mode.

use core::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::audio_buffer::AudioStreamBuffer;
use crate::config::{PipelineConfig, TRANSPORT_CHANNELS};
use crate::control_queue::ControlQueue;
use crate::device::AudioOutput;
use crate::engine::{velocity_to_midi, EngineConfig, EngineFactory};
use crate::error::{Error, Result};
use crate::fallback::{FallbackRenderer, SharedEngine};
use crate::output::{OutputCallback, TransportStats};
use crate::worker::{ContextEvent, WorkerContext, WorkerInit};

mod backend;

use backend::{Backend, DualContext, PipelineBackend, SingleContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Initializing,
    /// Dual-context transport running.
    Ready,
    /// Single-context fallback running.
    Degraded,
    Error,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    DualContext,
    SingleContextFallback,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::DualContext => "dual-context",
            BackendKind::SingleContextFallback => "single-context-fallback",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle signals for external collaborators.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    BackendSelected(BackendKind),
    Ready,
    Error(String),
    Closed,
}

/// Why the dual-context bring-up did not complete.
enum BringUp {
    /// The transport cannot run here; the factory is handed back for the fallback.
    Unavailable(EngineFactory, String),
    Failed(Error),
}

/// The orchestrator and the control API for external collaborators.
///
/// ```
/// use synthbridge::{OfflineOutput, Pipeline, PipelineConfig, PolySynth, BackendKind};
///
/// let (output, clock) = OfflineOutput::new(48_000, 2);
/// let mut pipeline = Pipeline::new(PipelineConfig::default(), output, PolySynth::factory());
/// assert_eq!(pipeline.init().unwrap(), BackendKind::DualContext);
/// assert!(pipeline.resume_output().unwrap());
///
/// pipeline.note_on(60, 0.8).unwrap();
/// let _quantum = clock.pull(128);
/// pipeline.note_off(60).unwrap();
/// pipeline.destroy();
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    state: PipelineState,
    output: Box<dyn AudioOutput>,
    factory: Option<EngineFactory>,
    backend: Option<PipelineBackend>,
    stats: Option<Arc<TransportStats>>,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    context_tx: Sender<ContextEvent>,
    context_rx: Receiver<ContextEvent>,
    reported_underruns: u64,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, output: impl AudioOutput + 'static, factory: EngineFactory) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (context_tx, context_rx) = crossbeam_channel::bounded(8);
        Self {
            config,
            state: PipelineState::Uninitialized,
            output: Box::new(output),
            factory: Some(factory),
            backend: None,
            stats: None,
            events_tx,
            events_rx,
            context_tx,
            context_rx,
            reported_underruns: 0,
        }
    }

    /// Brings the pipeline up and returns the backend in use.
    ///
    /// Falls back to the single-context backend if the host cannot run the
    /// dual-context transport. Failed handshakes and engine errors move the
    /// pipeline to [`PipelineState::Error`]; nothing is retried.
    pub fn init(&mut self) -> Result<BackendKind> {
        match self.state {
            PipelineState::Uninitialized => {}
            PipelineState::Ready | PipelineState::Degraded => {
                if let Some(backend) = &self.backend {
                    return Ok(backend.kind());
                }
            }
            state => return Err(Error::NotRunning(state)),
        }
        self.state = PipelineState::Initializing;

        if let Err(e) = self.config.validate() {
            return Err(self.enter_error(e));
        }
        // nothing resamples between the engine and the device
        let device_rate = self.output.sample_rate();
        if let Some(rate) = self.config.sample_rate.filter(|&rate| rate != device_rate) {
            return Err(self.enter_error(Error::InvalidConfig(format!(
                "sample rate {} does not match output device rate {}",
                rate, device_rate
            ))));
        }
        let factory = match self.factory.take() {
            Some(factory) => factory,
            None => return Err(self.enter_error(Error::EngineFailure("engine factory already used".into()))),
        };

        let factory = match self.check_environment() {
            Ok(()) => match self.start_dual_context(factory) {
                Ok(()) => return Ok(self.enter_running(BackendKind::DualContext)),
                Err(BringUp::Failed(e)) => return Err(self.enter_error(e)),
                Err(BringUp::Unavailable(factory, reason)) => {
                    warn!(reason = %reason, "dual-context transport unavailable");
                    factory
                }
            },
            Err(e) => {
                warn!(error = %e, "falling back to single-context rendering");
                factory
            }
        };

        match self.start_single_context(factory) {
            Ok(()) => Ok(self.enter_running(BackendKind::SingleContextFallback)),
            Err(e) => Err(self.enter_error(e)),
        }
    }

    fn check_environment(&self) -> Result<()> {
        if self.config.force_single_context {
            return Err(Error::EnvironmentUnsupported("single context forced by config".into()));
        }
        match self.output.capabilities().missing() {
            Some(reason) => Err(Error::EnvironmentUnsupported(reason.into())),
            None => Ok(()),
        }
    }

    /// The configured rate, or the output device's when none was set.
    pub fn sample_rate(&self) -> u32 {
        self.config
            .sample_rate
            .unwrap_or_else(|| self.output.sample_rate())
    }

    fn start_dual_context(&mut self, factory: EngineFactory) -> std::result::Result<(), BringUp> {
        let config = &self.config;
        let (control, control_region) =
            ControlQueue::new(config.control_capacity_bytes, config.note_off_reserve).map_err(BringUp::Failed)?;
        let (audio_region, reader) =
            AudioStreamBuffer::new(config.capacity_frames, TRANSPORT_CHANNELS).map_err(BringUp::Failed)?;
        let (commands, commands_rx) = rtrb::RingBuffer::new(config.command_capacity);
        debug!(
            capacity_frames = config.capacity_frames,
            control_bytes = config.control_capacity_bytes,
            "shared regions allocated"
        );

        let mut worker = match WorkerContext::spawn(self.context_tx.clone()) {
            Ok(worker) => worker,
            Err(e) => return Err(BringUp::Unavailable(factory, format!("cannot spawn worker: {}", e))),
        };

        // (a) the output context takes the audio region and acknowledges
        let stats = Arc::new(TransportStats::default());
        let connected = Arc::new(AtomicBool::new(false));
        let mut callback = OutputCallback::new(
            reader,
            self.output.channels(),
            config.max_quantum_frames,
            config.underrun_policy,
            stats.clone(),
            connected.clone(),
        );
        self.output
            .open(Box::new(move |data: &mut [f32]| callback.process(data)))
            .map_err(|e| BringUp::Failed(Error::HandshakeFailure(format!("output context: {}", e))))?;
        debug!("output context acknowledged audio region");

        // (b) the worker takes both regions and its configuration
        let init = WorkerInit {
            factory,
            sample_rate: self.sample_rate(),
            block_size: self.config.block_size,
            initial_volume: self.config.initial_volume,
            preset_payload: self.config.preset.clone(),
            audio_region,
            control_region,
            commands: commands_rx,
            target_ahead_frames: self.config.target_ahead_frames,
            poll_interval: self.config.poll_interval,
        };
        if let Err(e) = worker.handshake(init) {
            self.output.close();
            return Err(BringUp::Failed(e));
        }
        debug!("worker context ready");

        connected.store(true, Ordering::Release);
        self.stats = Some(stats);
        self.backend = Some(PipelineBackend::DualContext(DualContext::new(
            control, commands, worker, connected,
        )));
        Ok(())
    }

    fn start_single_context(&mut self, factory: EngineFactory) -> Result<()> {
        let engine_config = EngineConfig {
            sample_rate: self.sample_rate(),
            block_size: self.config.block_size,
        };
        let mut engine = factory(&engine_config)?;
        engine.set_volume(self.config.initial_volume);
        if let Some(payload) = &self.config.preset {
            engine.load_preset(payload)?;
        }

        let engine: SharedEngine = Arc::new(Mutex::new(engine));
        let mut renderer = FallbackRenderer::new(
            engine.clone(),
            self.config.block_size,
            self.output.channels(),
            self.context_tx.clone(),
        );
        self.output
            .open(Box::new(move |data: &mut [f32]| renderer.process(data)))?;

        self.backend = Some(PipelineBackend::SingleContext(SingleContext::new(engine)));
        Ok(())
    }

    fn enter_running(&mut self, kind: BackendKind) -> BackendKind {
        self.state = match kind {
            BackendKind::DualContext => PipelineState::Ready,
            BackendKind::SingleContextFallback => PipelineState::Degraded,
        };
        info!(backend = %kind, sample_rate = self.sample_rate(), "pipeline running");
        let _ = self.events_tx.send(PipelineEvent::BackendSelected(kind));
        let _ = self.events_tx.send(PipelineEvent::Ready);
        kind
    }

    /// Moves to `Error`, tears down the contexts and reports `cause`.
    fn enter_error(&mut self, cause: Error) -> Error {
        error!(error = %cause, "pipeline failed");
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
        }
        self.output.close();
        self.state = PipelineState::Error;
        let _ = self.events_tx.send(PipelineEvent::Error(cause.to_string()));
        cause
    }

    /// Picks up asynchronous failures and retries deferred note-offs.
    /// Returns the current state.
    pub fn poll(&mut self) -> PipelineState {
        while let Ok(event) = self.context_rx.try_recv() {
            match event {
                ContextEvent::EngineFailed(msg) => {
                    if matches!(self.state, PipelineState::Ready | PipelineState::Degraded) {
                        self.enter_error(Error::EngineFailure(msg));
                    }
                }
            }
        }

        if let Some(backend) = &mut self.backend {
            backend.flush();
        }

        let underruns = self.underrun_count();
        if underruns > self.reported_underruns {
            warn!(new = underruns - self.reported_underruns, total = underruns, "audio underrun");
            self.reported_underruns = underruns;
        }
        self.state
    }

    fn running_backend(&mut self) -> Result<&mut PipelineBackend> {
        let state = self.poll();
        match (state, self.backend.as_mut()) {
            (PipelineState::Ready, Some(backend)) | (PipelineState::Degraded, Some(backend)) => Ok(backend),
            (state, _) => Err(Error::NotRunning(state)),
        }
    }

    /// Starts the output device. Idempotent; returns whether output is running.
    pub fn resume_output(&mut self) -> Result<bool> {
        match self.poll() {
            PipelineState::Ready | PipelineState::Degraded => self.output.resume(),
            _ => Ok(false),
        }
    }

    /// `velocity` is clamped to `0.0..=1.0`.
    pub fn note_on(&mut self, note: u8, velocity: f32) -> Result<()> {
        if note > 127 {
            return Err(Error::InvalidNote(note));
        }
        self.running_backend()?.note_on(note, velocity_to_midi(velocity))
    }

    /// Note-offs are never dropped: if the control queue is full they are
    /// held back and delivered on a later call or [`poll`](Self::poll).
    pub fn note_off(&mut self, note: u8) -> Result<()> {
        if note > 127 {
            return Err(Error::InvalidNote(note));
        }
        self.running_backend()?.note_off(note)
    }

    /// Replaces the engine configuration without touching the transport.
    ///
    /// A rejected payload fails with [`Error::PresetLoadFailure`] and leaves
    /// the engine as it was.
    pub fn load_preset(&mut self, payload: &[u8]) -> Result<()> {
        let result = self.running_backend()?.load_preset(payload);
        if let Err(e) = &result {
            warn!(error = %e, "preset load failed");
        }
        result
    }

    /// `level` is clamped to `0.0..=1.0`.
    pub fn set_volume(&mut self, level: f32) -> Result<()> {
        if level.is_nan() {
            return Err(Error::InvalidConfig("volume is NaN".into()));
        }
        self.running_backend()?.set_volume(level.clamp(0.0, 1.0))
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    /// Lifecycle events: backend selection, ready, errors, close.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    /// Output quanta that hit an empty stream buffer. Always 0 in fallback mode.
    pub fn underrun_count(&self) -> u64 {
        self.stats.as_ref().map_or(0, |s| s.underruns())
    }

    pub fn frames_played(&self) -> u64 {
        self.stats.as_ref().map_or(0, |s| s.frames_played())
    }

    /// Frames buffered ahead of the output after the last quantum, or `None`
    /// when no stream buffer exists (fallback mode, or not running).
    pub fn buffered_frames(&self) -> Option<usize> {
        match self.state {
            PipelineState::Ready => self.stats.as_ref().map(|s| s.buffered_frames()),
            _ => None,
        }
    }

    /// Tears down both contexts and releases the shared regions. Idempotent.
    pub fn destroy(&mut self) {
        if self.state == PipelineState::Closed {
            return;
        }
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
        }
        self.output.close();
        self.state = PipelineState::Closed;
        info!("pipeline closed");
        let _ = self.events_tx.send(PipelineEvent::Closed);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_names() {
        assert_eq!(BackendKind::DualContext.to_string(), "dual-context");
        assert_eq!(
            BackendKind::SingleContextFallback.to_string(),
            "single-context-fallback"
        );
    }
}
