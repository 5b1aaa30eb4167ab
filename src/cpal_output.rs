//! Output through a CPAL device.
//!
//! `cpal::Stream` cannot leave the thread that built it, so the stream lives
//! on a dedicated thread that takes commands over a channel.

use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfig};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info};

use crate::device::{AudioOutput, HostCapabilities, RenderCallback};
use crate::error::{Error, Result};

/// Samples converted per pass for integer sample formats.
const SCRATCH_SAMPLES: usize = 4096;

enum StreamCommand {
    Resume(Sender<Result<bool>>),
    Close,
}

struct StreamThread {
    commands: Sender<StreamCommand>,
    handle: JoinHandle<()>,
}

/// A discovered output device.
pub struct CpalOutput {
    device: cpal::Device,
    config: SupportedStreamConfig,
    name: String,
    stream: Option<StreamThread>,
    running: bool,
}

impl CpalOutput {
    fn from_device(device: cpal::Device) -> Option<Self> {
        let config = device.default_output_config().ok()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".into());
        Some(Self {
            device,
            config,
            name,
            stream: None,
            running: false,
        })
    }

    pub fn default_output() -> Option<Self> {
        let host = cpal::default_host();
        Self::from_device(host.default_output_device()?)
    }

    pub fn list_outputs() -> Vec<Self> {
        let host = cpal::default_host();
        host.output_devices()
            .map(|devices| devices.filter_map(Self::from_device).collect())
            .unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    fn channels(&self) -> usize {
        self.config.channels() as usize
    }

    fn capabilities(&self) -> HostCapabilities {
        HostCapabilities::full()
    }

    fn open(&mut self, callback: RenderCallback) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::Output(format!("{} is already open", self.name)));
        }

        let device = self.device.clone();
        let config = self.config.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (commands, commands_rx) = crossbeam_channel::bounded(4);

        let handle = thread::Builder::new()
            .name("synth-output".into())
            .spawn(move || run_stream(device, config, callback, ready_tx, commands_rx))
            .map_err(|e| Error::Output(format!("cannot spawn output thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                debug!(device = %self.name, "output stream built");
                self.stream = Some(StreamThread { commands, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::Output("output thread exited during setup".into()))
            }
        }
    }

    fn resume(&mut self) -> Result<bool> {
        let stream = match &self.stream {
            Some(stream) => stream,
            None => return Ok(false),
        };
        if self.running {
            return Ok(true);
        }
        let (reply, result) = crossbeam_channel::bounded(1);
        stream
            .commands
            .send(StreamCommand::Resume(reply))
            .map_err(|_| Error::Output("output thread is gone".into()))?;
        self.running = result
            .recv()
            .map_err(|_| Error::Output("output thread is gone".into()))??;
        Ok(self.running)
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn close(&mut self) {
        self.running = false;
        if let Some(stream) = self.stream.take() {
            let _ = stream.commands.send(StreamCommand::Close);
            if stream.handle.join().is_err() {
                error!("output thread panicked");
            }
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_stream(
    device: cpal::Device,
    config: SupportedStreamConfig,
    callback: RenderCallback,
    ready: Sender<Result<()>>,
    commands: Receiver<StreamCommand>,
) {
    let stream = match build_stream(&device, &config, callback) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    // suspended until resumed
    let _ = stream.pause();
    if ready.send(Ok(())).is_err() {
        return;
    }

    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Resume(reply) => {
                let result = stream
                    .play()
                    .map(|()| true)
                    .map_err(|e| Error::Output(e.to_string()));
                if result.is_ok() {
                    info!(sample_rate = config.sample_rate().0, "output stream playing");
                }
                let _ = reply.send(result);
            }
            StreamCommand::Close => break,
        }
    }
    drop(stream);
    debug!("output stream closed");
}

fn build_stream(
    device: &cpal::Device,
    config: &SupportedStreamConfig,
    mut callback: RenderCallback,
) -> Result<cpal::Stream> {
    let stream_config = config.config();
    let channels = stream_config.channels.max(1) as usize;
    // whole frames per conversion pass
    let mut scratch = vec![0.0f32; SCRATCH_SAMPLES - SCRATCH_SAMPLES % channels];
    let on_error = |err: cpal::StreamError| error!(error = %err, "output stream error");

    let stream = match config.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _| callback(data),
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _| {
                for chunk in data.chunks_mut(scratch.len()) {
                    let buf = &mut scratch[..chunk.len()];
                    callback(buf);
                    for (out, s) in chunk.iter_mut().zip(buf.iter()) {
                        *out = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    }
                }
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [u16], _| {
                for chunk in data.chunks_mut(scratch.len()) {
                    let buf = &mut scratch[..chunk.len()];
                    callback(buf);
                    for (out, s) in chunk.iter_mut().zip(buf.iter()) {
                        *out = ((s.clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32) as u16;
                    }
                }
            },
            on_error,
            None,
        ),
        format => {
            return Err(Error::Output(format!("unsupported sample format {:?}", format)));
        }
    };
    stream.map_err(|e| Error::Output(e.to_string()))
}
