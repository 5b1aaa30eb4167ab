//! Output devices.
//!
//! An [`AudioOutput`] owns the real-time output context. The pipeline hands it
//! a render callback through [`open`](AudioOutput::open), which returns once
//! the context has acknowledged. Playback starts on
//! [`resume`](AudioOutput::resume).
//!
//! [`OfflineOutput`] is a headless device: nothing runs until the paired
//! [`OfflineClock`] pulls a quantum, which makes it the device of choice for
//! tests and offline rendering.
//!
//! ```
//! use synthbridge::{OfflineOutput, AudioOutput};
//!
//! let (mut output, clock) = OfflineOutput::new(48_000, 2);
//! output.open(Box::new(|data: &mut [f32]| data.iter_mut().for_each(|s| *s = 0.5))).unwrap();
//! assert_eq!(clock.pull(4), vec![0.0; 8]); // not resumed yet
//! output.resume().unwrap();
//! assert_eq!(clock.pull(4), vec![0.5; 8]);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Render callback run by the output context: fills one quantum of
/// interleaved samples, `channels()` per frame.
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// What the host can offer the dual-context transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Memory can be shared between the worker and the output context.
    pub shared_memory: bool,
    /// The output runs in its own real-time context.
    pub realtime_output: bool,
}

impl HostCapabilities {
    pub fn full() -> Self {
        Self {
            shared_memory: true,
            realtime_output: true,
        }
    }

    /// Reason the dual-context transport cannot run here, if any.
    pub fn missing(&self) -> Option<&'static str> {
        if !self.shared_memory {
            Some("no shared memory between contexts")
        } else if !self.realtime_output {
            Some("no real-time output context")
        } else {
            None
        }
    }
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self::full()
    }
}

/// An audio output device.
pub trait AudioOutput: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> usize;

    fn capabilities(&self) -> HostCapabilities;

    /// Moves `callback` into the output context and waits for it to
    /// acknowledge. The device stays suspended until [`resume`](Self::resume).
    fn open(&mut self, callback: RenderCallback) -> Result<()>;

    /// Starts or continues playback. Idempotent; returns whether the output
    /// is running.
    fn resume(&mut self) -> Result<bool>;

    fn is_running(&self) -> bool;

    /// Stops playback and drops the callback.
    fn close(&mut self);
}

#[derive(Default)]
struct OfflineState {
    callback: Option<RenderCallback>,
    running: bool,
}

fn lock(state: &Mutex<OfflineState>) -> MutexGuard<'_, OfflineState> {
    // a panicking callback must not take the device down with it
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Headless output driven by an [`OfflineClock`].
pub struct OfflineOutput {
    state: Arc<Mutex<OfflineState>>,
    sample_rate: u32,
    channels: usize,
    capabilities: HostCapabilities,
}

/// Pulls quanta from an [`OfflineOutput`], standing in for the hardware clock.
#[derive(Clone)]
pub struct OfflineClock {
    state: Arc<Mutex<OfflineState>>,
    channels: usize,
}

impl OfflineOutput {
    pub fn new(sample_rate: u32, channels: usize) -> (Self, OfflineClock) {
        let state = Arc::new(Mutex::new(OfflineState::default()));
        let channels = channels.max(1);
        (
            Self {
                state: state.clone(),
                sample_rate,
                channels,
                capabilities: HostCapabilities::full(),
            },
            OfflineClock { state, channels },
        )
    }

    /// Overrides what the device reports, e.g. to exercise the fallback.
    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl AudioOutput for OfflineOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    fn open(&mut self, callback: RenderCallback) -> Result<()> {
        let mut state = lock(&self.state);
        if state.callback.is_some() {
            return Err(Error::Output("offline output is already open".into()));
        }
        state.callback = Some(callback);
        Ok(())
    }

    fn resume(&mut self) -> Result<bool> {
        let mut state = lock(&self.state);
        state.running = state.callback.is_some();
        Ok(state.running)
    }

    fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.running = false;
        state.callback = None;
    }
}

impl OfflineClock {
    /// Runs the callback for one quantum of `frames` frames and returns the
    /// interleaved samples. Silence while the device is suspended or closed.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut data = vec![0.0; frames * self.channels];
        self.pull_into(&mut data);
        data
    }

    pub fn pull_into(&self, data: &mut [f32]) {
        let mut state = lock(&self.state);
        let running = state.running;
        match state.callback.as_mut() {
            Some(callback) if running => callback(data),
            _ => data.iter_mut().for_each(|s| *s = 0.0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}
