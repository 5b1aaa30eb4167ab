//! The two rendering backends behind one control interface.
//!
//! This module imports [`Error`] but not the crate's `Result` alias:
//! `enum_delegate` expands to code that names the two-parameter `Result`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::debug;

use super::BackendKind;
use crate::control_queue::{ControlProducer, ControlRecord};
use crate::engine::SynthEngine;
use crate::error::{self, Error};
use crate::fallback::SharedEngine;
use crate::worker::{WorkerCommand, WorkerContext};

/// How often a blocked preset load checks that the worker is still there.
const REPLY_POLL: Duration = Duration::from_millis(10);

/// The control surface both backends provide.
#[enum_delegate::register]
pub(super) trait Backend {
    fn kind(&self) -> BackendKind;
    fn note_on(&mut self, note: u8, velocity: u8) -> error::Result<()>;
    fn note_off(&mut self, note: u8) -> error::Result<()>;
    fn load_preset(&mut self, payload: &[u8]) -> error::Result<()>;
    fn set_volume(&mut self, level: f32) -> error::Result<()>;
    /// Retries deferred deliveries.
    fn flush(&mut self);
    fn shutdown(&mut self);
}

#[enum_delegate::implement(Backend)]
pub(super) enum PipelineBackend {
    DualContext(DualContext),
    SingleContext(SingleContext),
}

/// Control side of the dual-context transport.
pub(super) struct DualContext {
    control: ControlProducer,
    commands: rtrb::Producer<WorkerCommand>,
    /// Note-offs the control queue had no room for, oldest first.
    pending_note_offs: VecDeque<u8>,
    worker: WorkerContext,
    connected: Arc<AtomicBool>,
}

fn worker_gone() -> Error {
    Error::EngineFailure("synthesis worker is no longer running".into())
}

impl DualContext {
    pub(super) fn new(
        control: ControlProducer,
        commands: rtrb::Producer<WorkerCommand>,
        worker: WorkerContext,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            control,
            commands,
            pending_note_offs: VecDeque::new(),
            worker,
            connected,
        }
    }

    fn send_command(&mut self, command: WorkerCommand) -> error::Result<()> {
        if self.commands.is_abandoned() {
            return Err(worker_gone());
        }
        self.commands
            .push(command)
            .map_err(|_| Error::ControlQueueOverflow)
    }
}

impl Backend for DualContext {
    fn kind(&self) -> BackendKind {
        BackendKind::DualContext
    }

    fn note_on(&mut self, note: u8, velocity: u8) -> error::Result<()> {
        self.flush();
        // may not overtake a deferred note-off
        if self.pending_note_offs.is_empty() && self.control.write(ControlRecord::NoteOn { note, velocity }) {
            Ok(())
        } else {
            Err(Error::ControlQueueOverflow)
        }
    }

    fn note_off(&mut self, note: u8) -> error::Result<()> {
        self.flush();
        if !self.pending_note_offs.is_empty() || !self.control.write(ControlRecord::NoteOff { note }) {
            debug!(note, "control queue full, deferring note-off");
            self.pending_note_offs.push_back(note);
        }
        Ok(())
    }

    fn load_preset(&mut self, payload: &[u8]) -> error::Result<()> {
        let (reply, result) = crossbeam_channel::bounded(1);
        self.send_command(WorkerCommand::LoadPreset {
            payload: payload.to_vec(),
            reply,
        })?;
        // an exited worker leaves the command, and its reply sender, queued
        loop {
            match result.recv_timeout(REPLY_POLL) {
                Ok(outcome) => return outcome.map_err(Error::from),
                Err(RecvTimeoutError::Disconnected) => return Err(worker_gone()),
                Err(RecvTimeoutError::Timeout) if self.commands.is_abandoned() => {
                    return match result.try_recv() {
                        Ok(outcome) => outcome.map_err(Error::from),
                        Err(_) => Err(worker_gone()),
                    };
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn set_volume(&mut self, level: f32) -> error::Result<()> {
        self.send_command(WorkerCommand::SetVolume(level))
    }

    fn flush(&mut self) {
        while let Some(&note) = self.pending_note_offs.front() {
            if !self.control.write(ControlRecord::NoteOff { note }) {
                break;
            }
            self.pending_note_offs.pop_front();
        }
    }

    fn shutdown(&mut self) {
        self.connected.store(false, Ordering::Release);
        self.worker.stop();
    }
}

/// Control side of the fallback: the engine itself.
pub(super) struct SingleContext {
    engine: SharedEngine,
}

impl SingleContext {
    pub(super) fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }

    fn with_engine<T>(&self, f: impl FnOnce(&mut dyn SynthEngine) -> T) -> error::Result<T> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| Error::EngineFailure("engine lock poisoned".into()))?;
        Ok(f(engine.as_mut()))
    }
}

impl Backend for SingleContext {
    fn kind(&self) -> BackendKind {
        BackendKind::SingleContextFallback
    }

    fn note_on(&mut self, note: u8, velocity: u8) -> error::Result<()> {
        self.with_engine(|e| e.note_on(note, velocity))
    }

    fn note_off(&mut self, note: u8) -> error::Result<()> {
        self.with_engine(|e| e.note_off(note))
    }

    fn load_preset(&mut self, payload: &[u8]) -> error::Result<()> {
        self.with_engine(|e| e.load_preset(payload))?
            .map_err(Error::from)
    }

    fn set_volume(&mut self, level: f32) -> error::Result<()> {
        self.with_engine(|e| e.set_volume(level))
    }

    fn flush(&mut self) {}

    fn shutdown(&mut self) {}
}
