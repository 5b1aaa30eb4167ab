//! Single-context fallback renderer.
//!
//! Used when the dual-context transport cannot be set up. The engine lives
//! behind a mutex shared with the control side, and every quantum is rendered
//! synchronously inside the output callback, block by block. Frames left over
//! from a block carry into the next quantum. Locking in the output path is
//! the accepted cost of running without a worker.

use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::engine::SynthEngine;
use crate::worker::ContextEvent;

pub(crate) type SharedEngine = Arc<Mutex<Box<dyn SynthEngine>>>;

pub(crate) struct FallbackRenderer {
    engine: SharedEngine,
    left: Vec<f32>,
    right: Vec<f32>,
    /// Frames of the current block still unplayed start here.
    carry_index: usize,
    carry_available: usize,
    device_channels: usize,
    events: Sender<ContextEvent>,
    failed: bool,
}

impl FallbackRenderer {
    pub(crate) fn new(
        engine: SharedEngine,
        block_size: usize,
        device_channels: usize,
        events: Sender<ContextEvent>,
    ) -> Self {
        let block_size = block_size.max(1);
        Self {
            engine,
            left: vec![0.0; block_size],
            right: vec![0.0; block_size],
            carry_index: 0,
            carry_available: 0,
            device_channels: device_channels.max(1),
            events,
            failed: false,
        }
    }

    pub(crate) fn process(&mut self, data: &mut [f32]) {
        if self.failed {
            data.iter_mut().for_each(|s| *s = 0.0);
            return;
        }
        let mut engine = match self.engine.lock() {
            Ok(engine) => engine,
            Err(_) => {
                data.iter_mut().for_each(|s| *s = 0.0);
                return;
            }
        };

        let device_channels = self.device_channels;
        let whole = data.len() - data.len() % device_channels;
        let (data, rest) = data.split_at_mut(whole);
        rest.iter_mut().for_each(|s| *s = 0.0);

        let mut frames = data.chunks_exact_mut(device_channels);
        for frame in frames.by_ref() {
            if self.carry_index >= self.carry_available {
                if let Err(e) = engine.render(&mut self.left, &mut self.right) {
                    self.failed = true;
                    let _ = self.events.try_send(ContextEvent::EngineFailed(e.to_string()));
                    frame.iter_mut().for_each(|s| *s = 0.0);
                    break;
                }
                self.carry_index = 0;
                self.carry_available = self.left.len();
            }

            let i = self.carry_index;
            for (c, sample) in frame.iter_mut().enumerate() {
                *sample = if c == 0 { self.left[i] } else { self.right[i] };
            }
            self.carry_index += 1;
        }
        for frame in frames {
            frame.iter_mut().for_each(|s| *s = 0.0);
        }
    }
}
