//! The synthesis worker: owns the engine and renders ahead of the output.
//!
//! Each [`SynthesisWorker::step`] runs one bounded unit of work:
//!
//! 1. drain the control queue into the engine
//! 2. apply out-of-band commands (volume, presets)
//! 3. stop if the look-ahead target is already buffered
//! 4. stop if a whole block would not fit (overflow backoff)
//! 5. render one block, interleave it, write it
//!
//! The worker thread repeats steps, sleeping for the poll interval whenever a
//! step did not leave it behind target. It never waits on the output side.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::audio_buffer::AudioWriter;
use crate::control_queue::{ControlConsumer, ControlRecord};
use crate::engine::{EngineConfig, EngineFactory, SynthEngine};
use crate::error::{EngineError, Error, Result};

/// Messages to the worker that do not go through the note queue.
pub(crate) enum WorkerCommand {
    SetVolume(f32),
    LoadPreset {
        payload: Vec<u8>,
        reply: Sender<std::result::Result<(), EngineError>>,
    },
}

/// The `init` message: everything the worker context needs to start.
pub(crate) struct WorkerInit {
    pub(crate) factory: EngineFactory,
    pub(crate) sample_rate: u32,
    pub(crate) block_size: usize,
    pub(crate) initial_volume: f32,
    pub(crate) preset_payload: Option<Vec<u8>>,
    pub(crate) audio_region: AudioWriter,
    pub(crate) control_region: ControlConsumer,
    pub(crate) commands: rtrb::Consumer<WorkerCommand>,
    pub(crate) target_ahead_frames: usize,
    pub(crate) poll_interval: Duration,
}

/// A context's answer to its init message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HandshakeReply {
    Ready,
    Error { message: String },
}

/// Asynchronous failure reports from a rendering context.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ContextEvent {
    EngineFailed(String),
}

/// Outcome of one render-loop step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Rendered a block and is still below target; step again right away.
    CatchUp,
    /// At or above the look-ahead target; yield.
    Ahead,
    /// Not enough room for a block; back off.
    Overflow,
}

pub struct SynthesisWorker {
    engine: Box<dyn SynthEngine>,
    control: ControlConsumer,
    audio: AudioWriter,
    commands: rtrb::Consumer<WorkerCommand>,
    block_size: usize,
    target_ahead: usize,
    left: Vec<f32>,
    right: Vec<f32>,
    /// One block of interleaved frames, reused every step.
    interleaved: Vec<f32>,
}

impl SynthesisWorker {
    pub(crate) fn new(
        engine: Box<dyn SynthEngine>,
        control: ControlConsumer,
        audio: AudioWriter,
        commands: rtrb::Consumer<WorkerCommand>,
        block_size: usize,
        target_ahead: usize,
    ) -> Self {
        let channels = audio.channels();
        Self {
            engine,
            control,
            audio,
            commands,
            block_size,
            target_ahead,
            left: vec![0.0; block_size],
            right: vec![0.0; block_size],
            interleaved: vec![0.0; block_size * channels],
        }
    }

    /// Frames currently buffered ahead of the output.
    pub fn buffered_frames(&self) -> usize {
        self.audio.available_read()
    }

    /// Runs one unit of work. Engine errors are fatal to the worker.
    pub fn step(&mut self) -> std::result::Result<Step, EngineError> {
        let engine = &mut self.engine;
        self.control.drain(|record| match record {
            ControlRecord::NoteOn { note, velocity } => engine.note_on(note, velocity),
            ControlRecord::NoteOff { note } => engine.note_off(note),
        });
        self.apply_commands();

        let buffered = self.audio.available_read();
        if buffered >= self.target_ahead {
            return Ok(Step::Ahead);
        }
        if self.audio.available_write() < self.block_size {
            return Ok(Step::Overflow);
        }

        self.engine.render(&mut self.left, &mut self.right)?;

        let channels = self.audio.channels();
        for (i, frame) in self.interleaved.chunks_exact_mut(channels).enumerate() {
            for (c, sample) in frame.iter_mut().enumerate() {
                *sample = if c == 0 { self.left[i] } else { self.right[i] };
            }
        }

        let written = self.audio.write(&self.interleaved);
        if buffered + written < self.target_ahead {
            Ok(Step::CatchUp)
        } else {
            Ok(Step::Ahead)
        }
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                WorkerCommand::SetVolume(level) => self.engine.set_volume(level),
                WorkerCommand::LoadPreset { payload, reply } => {
                    let result = self.engine.load_preset(&payload);
                    match &result {
                        Ok(()) => info!(bytes = payload.len(), "preset loaded"),
                        Err(e) => warn!(error = %e, "preset rejected"),
                    }
                    // the caller may have given up waiting
                    let _ = reply.send(result);
                }
            }
        }
    }
}

/// The spawned worker context, before and after its handshake.
pub(crate) struct WorkerContext {
    init: Option<Sender<WorkerInit>>,
    replies: Receiver<HandshakeReply>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerContext {
    /// Starts the worker thread. It builds the engine once it receives its
    /// init message.
    pub(crate) fn spawn(events: Sender<ContextEvent>) -> std::io::Result<Self> {
        let (init_tx, init_rx) = crossbeam_channel::bounded(1);
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let handle = thread::Builder::new()
            .name("synth-worker".into())
            .spawn(move || run(init_rx, reply_tx, events, flag))?;

        Ok(Self {
            init: Some(init_tx),
            replies: reply_rx,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Sends the init message and waits for `ready` or `error`.
    pub(crate) fn handshake(&mut self, init: WorkerInit) -> Result<()> {
        let sender = self
            .init
            .take()
            .ok_or_else(|| Error::HandshakeFailure("worker already initialized".into()))?;
        sender
            .send(init)
            .map_err(|_| Error::HandshakeFailure("worker context exited before init".into()))?;

        match self.replies.recv() {
            Ok(HandshakeReply::Ready) => Ok(()),
            Ok(HandshakeReply::Error { message }) => Err(Error::HandshakeFailure(message)),
            Err(_) => Err(Error::HandshakeFailure(
                "worker context exited without replying".into(),
            )),
        }
    }

    /// Signals the worker and waits for its current step to finish.
    pub(crate) fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // unblocks a worker still waiting for init
        self.init.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("synthesis worker panicked");
            }
        }
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    init: Receiver<WorkerInit>,
    reply: Sender<HandshakeReply>,
    events: Sender<ContextEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let init = match init.recv() {
        Ok(init) => init,
        Err(_) => {
            debug!("worker dismissed before init");
            return;
        }
    };

    let config = EngineConfig {
        sample_rate: init.sample_rate,
        block_size: init.block_size,
    };
    let mut engine = match (init.factory)(&config) {
        Ok(engine) => engine,
        Err(e) => {
            let _ = reply.send(HandshakeReply::Error { message: e.to_string() });
            return;
        }
    };
    engine.set_volume(init.initial_volume);
    if let Some(payload) = &init.preset_payload {
        if let Err(e) = engine.load_preset(payload) {
            let _ = reply.send(HandshakeReply::Error { message: e.to_string() });
            return;
        }
    }

    let mut worker = SynthesisWorker::new(
        engine,
        init.control_region,
        init.audio_region,
        init.commands,
        init.block_size,
        init.target_ahead_frames,
    );
    if reply.send(HandshakeReply::Ready).is_err() {
        return;
    }
    info!(
        sample_rate = init.sample_rate,
        block_size = init.block_size,
        target_ahead = init.target_ahead_frames,
        "synthesis worker running"
    );

    let poll_interval = init.poll_interval;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> std::result::Result<(), EngineError> {
        while !shutdown.load(Ordering::Acquire) {
            match worker.step()? {
                Step::CatchUp => {}
                Step::Ahead | Step::Overflow => thread::sleep(poll_interval),
            }
        }
        Ok(())
    }));

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(payload) => Some(format!("engine panicked: {}", panic_message(payload.as_ref()))),
    };
    if let Some(message) = failure {
        error!(error = %message, "synthesis worker stopped on failure");
        let _ = events.try_send(ContextEvent::EngineFailed(message));
    }
    // dropping the worker abandons the command queue
    drop(worker);
    debug!("synthesis worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
