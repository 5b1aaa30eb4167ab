//! The real-time output callback.
//!
//! Runs once per hardware quantum on the device's thread. It makes one bounded
//! read attempt per quantum (or per `max_quantum` chunk when the device asks
//! for more), never allocates, never blocks and never logs. Underruns are
//! filled per [`UnderrunPolicy`] and counted in [`TransportStats`], which the
//! control side reads.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio_buffer::AudioReader;

/// What the callback writes when the stream buffer cannot cover a quantum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnderrunPolicy {
    #[default]
    Silence,
    /// Repeat the last frame that was played.
    HoldLast,
}

/// Counters shared between the output callback and the control side.
#[derive(Debug, Default)]
pub struct TransportStats {
    underruns: AtomicU64,
    frames_played: AtomicU64,
    buffered_frames: AtomicUsize,
}

impl TransportStats {
    /// Quanta (or chunks) that could not be served from the stream buffer.
    #[inline]
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Frames handed to the device, silence included.
    #[inline]
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    /// Frames left in the stream buffer after the last quantum.
    #[inline]
    pub fn buffered_frames(&self) -> usize {
        self.buffered_frames.load(Ordering::Relaxed)
    }
}

pub struct OutputCallback {
    reader: AudioReader,
    /// One scratch plane per transport channel, `max_quantum` frames each.
    planes: Vec<Vec<f32>>,
    last: Vec<f32>,
    device_channels: usize,
    policy: UnderrunPolicy,
    stats: Arc<TransportStats>,
    connected: Arc<AtomicBool>,
}

impl OutputCallback {
    /// `connected` gates playback: until it is set the callback plays silence
    /// without touching the reader.
    pub fn new(
        reader: AudioReader,
        device_channels: usize,
        max_quantum: usize,
        policy: UnderrunPolicy,
        stats: Arc<TransportStats>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        let channels = reader.channels();
        Self {
            planes: vec![vec![0.0; max_quantum.max(1)]; channels],
            last: vec![0.0; channels],
            reader,
            device_channels: device_channels.max(1),
            policy,
            stats,
            connected,
        }
    }

    /// Fills one quantum of interleaved device samples.
    ///
    /// Device channel `c` plays transport channel `min(c, channels - 1)`.
    pub fn process(&mut self, data: &mut [f32]) {
        let device_channels = self.device_channels;
        let whole = data.len() - data.len() % device_channels;
        let (data, rest) = data.split_at_mut(whole);
        rest.iter_mut().for_each(|s| *s = 0.0);

        if !self.connected.load(Ordering::Acquire) {
            data.iter_mut().for_each(|s| *s = 0.0);
            return;
        }

        let src_channels = self.planes.len();
        let max_frames = self.planes[0].len();

        for chunk in data.chunks_mut(max_frames * device_channels) {
            let frames = chunk.len() / device_channels;

            if self.reader.read(&mut self.planes, frames) {
                for (i, frame) in chunk.chunks_exact_mut(device_channels).enumerate() {
                    for (c, sample) in frame.iter_mut().enumerate() {
                        *sample = self.planes[c.min(src_channels - 1)][i];
                    }
                }
                if frames > 0 {
                    for (last, plane) in self.last.iter_mut().zip(self.planes.iter()) {
                        *last = plane[frames - 1];
                    }
                }
            } else {
                self.stats.underruns.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    UnderrunPolicy::Silence => chunk.iter_mut().for_each(|s| *s = 0.0),
                    UnderrunPolicy::HoldLast => {
                        for frame in chunk.chunks_exact_mut(device_channels) {
                            for (c, sample) in frame.iter_mut().enumerate() {
                                *sample = self.last[c.min(src_channels - 1)];
                            }
                        }
                    }
                }
            }
        }

        self.stats
            .frames_played
            .fetch_add((whole / device_channels) as u64, Ordering::Relaxed);
        self.stats
            .buffered_frames
            .store(self.reader.available_read(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_buffer::{AudioStreamBuffer, AudioWriter};

    fn callback(
        device_channels: usize,
        max_quantum: usize,
        policy: UnderrunPolicy,
    ) -> (AudioWriter, OutputCallback, Arc<TransportStats>) {
        let (writer, reader) = AudioStreamBuffer::new(64, 2).unwrap();
        let stats = Arc::new(TransportStats::default());
        let connected = Arc::new(AtomicBool::new(true));
        let cb = OutputCallback::new(reader, device_channels, max_quantum, policy, stats.clone(), connected);
        (writer, cb, stats)
    }

    #[test]
    fn plays_buffered_frames_interleaved() {
        let (mut w, mut cb, stats) = callback(2, 16, UnderrunPolicy::Silence);
        w.write(&[0.1, -0.1, 0.2, -0.2, 0.3, -0.3, 0.4, -0.4]);

        let mut data = [9.0f32; 6];
        cb.process(&mut data);
        assert_eq!(data, [0.1, -0.1, 0.2, -0.2, 0.3, -0.3]);
        assert_eq!(stats.underruns(), 0);
        assert_eq!(stats.frames_played(), 3);
        assert_eq!(stats.buffered_frames(), 1);
    }

    #[test]
    fn underrun_plays_silence_and_keeps_the_buffer() {
        let (mut w, mut cb, stats) = callback(2, 16, UnderrunPolicy::Silence);
        w.write(&[0.5, 0.5]);

        let mut data = [9.0f32; 4];
        cb.process(&mut data);
        assert_eq!(data, [0.0; 4]);
        assert_eq!(stats.underruns(), 1);
        assert_eq!(stats.buffered_frames(), 1);
    }

    #[test]
    fn hold_last_repeats_the_previous_frame() {
        let (mut w, mut cb, stats) = callback(2, 16, UnderrunPolicy::HoldLast);
        w.write(&[0.1, 0.2, 0.3, 0.4]);

        let mut data = [0.0f32; 4];
        cb.process(&mut data);
        cb.process(&mut data);
        assert_eq!(data, [0.3, 0.4, 0.3, 0.4]);
        assert_eq!(stats.underruns(), 1);
    }

    #[test]
    fn extra_device_channels_take_the_last_transport_channel() {
        let (mut w, mut cb, _) = callback(4, 16, UnderrunPolicy::Silence);
        w.write(&[0.1, 0.2]);

        let mut data = [0.0f32; 4];
        cb.process(&mut data);
        assert_eq!(data, [0.1, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn large_quanta_are_served_in_chunks() {
        let (mut w, mut cb, stats) = callback(2, 4, UnderrunPolicy::Silence);
        let frames: Vec<f32> = (0..10).flat_map(|i| [i as f32, i as f32]).collect();
        w.write(&frames);

        let mut data = [0.0f32; 20];
        cb.process(&mut data);
        assert_eq!(data.to_vec(), frames);
        assert_eq!(stats.underruns(), 0);
        assert_eq!(stats.frames_played(), 10);
    }

    #[test]
    fn disconnected_callback_plays_silence_without_reading() {
        let (mut writer, reader) = AudioStreamBuffer::new(8, 2).unwrap();
        let stats = Arc::new(TransportStats::default());
        let connected = Arc::new(AtomicBool::new(false));
        let mut cb = OutputCallback::new(reader, 2, 8, UnderrunPolicy::Silence, stats.clone(), connected.clone());
        writer.write(&[1.0, 1.0]);

        let mut data = [5.0f32; 2];
        cb.process(&mut data);
        assert_eq!(data, [0.0; 2]);
        assert_eq!(stats.underruns(), 0);
        assert_eq!(writer.available_read(), 1);

        connected.store(true, Ordering::Release);
        cb.process(&mut data);
        assert_eq!(data, [1.0, 1.0]);
    }
}
