//! SPSC ring buffer of interleaved audio frames.
//!
//! Capacity and indices are in frames; sample `c` of frame `i` lives at
//! `slot(i) * channels + c`. Writes and reads are all-or-nothing: a write that
//! does not fit is rejected and a read that cannot be fully served fails
//! without consuming anything.

use crate::error::{Error, Result};
use crate::region::{self, RegionConsumer, RegionProducer};

/// Constructor for an audio stream buffer pair.
pub struct AudioStreamBuffer;

impl AudioStreamBuffer {
    /// Creates a buffer holding `capacity_frames` frames (a power of two) of
    /// `channels` interleaved samples each.
    pub fn new(capacity_frames: usize, channels: usize) -> Result<(AudioWriter, AudioReader)> {
        if channels == 0 {
            return Err(Error::InvalidConfig("audio buffer needs at least one channel".into()));
        }
        let (producer, consumer) = region::split::<f32>(capacity_frames, channels)?;
        Ok((
            AudioWriter { inner: producer },
            AudioReader { inner: consumer },
        ))
    }
}

/// Producer half, owned by the synthesis worker.
pub struct AudioWriter {
    inner: RegionProducer<f32>,
}

impl AudioWriter {
    /// Frames that can be written right now.
    #[inline]
    pub fn available_write(&self) -> usize {
        self.inner.writable()
    }

    /// Frames buffered ahead of the reader.
    #[inline]
    pub fn available_read(&self) -> usize {
        self.inner.readable()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.inner.stride()
    }

    /// Writes interleaved frames, returning the number of frames written.
    ///
    /// Returns 0 and leaves the buffer unchanged if `interleaved` holds more
    /// frames than [`available_write`](Self::available_write) or is not a whole
    /// number of frames.
    pub fn write(&mut self, interleaved: &[f32]) -> usize {
        let channels = self.channels();
        if interleaved.is_empty() || interleaved.len() % channels != 0 {
            return 0;
        }
        let frames = interleaved.len() / channels;
        if frames > self.available_write() {
            return 0;
        }
        if !self.inner.stage(0, interleaved) {
            return 0;
        }
        self.inner.publish(frames);
        frames
    }
}

/// Consumer half, owned by the output callback.
pub struct AudioReader {
    inner: RegionConsumer<f32>,
}

impl AudioReader {
    #[inline]
    pub fn available_read(&self) -> usize {
        self.inner.readable()
    }

    #[inline]
    pub fn available_write(&self) -> usize {
        self.inner.writable()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.inner.stride()
    }

    /// De-interleaves `frames` frames into one destination slice per channel.
    ///
    /// Fails (returns `false`) without consuming anything if fewer than
    /// `frames` frames are buffered, if `outputs` does not have exactly one
    /// slice per channel, or if any slice is shorter than `frames`. Does not
    /// allocate.
    pub fn read<S: AsMut<[f32]>>(&mut self, outputs: &mut [S], frames: usize) -> bool {
        let channels = self.channels();
        if outputs.len() != channels || outputs.iter_mut().any(|o| o.as_mut().len() < frames) {
            return false;
        }
        if frames == 0 {
            return true;
        }
        if frames > self.available_read() {
            return false;
        }

        let (first, second) = match self.inner.slices(0, frames) {
            Some(parts) => parts,
            None => return false,
        };

        let first_frames = first.len() / channels;
        for (i, frame) in first.chunks_exact(channels).enumerate() {
            for (out, &sample) in outputs.iter_mut().zip(frame) {
                out.as_mut()[i] = sample;
            }
        }
        for (i, frame) in second.chunks_exact(channels).enumerate() {
            for (out, &sample) in outputs.iter_mut().zip(frame) {
                out.as_mut()[first_frames + i] = sample;
            }
        }

        self.inner.release(frames);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize, start: f32) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let v = start + i as f32;
                [v, -v]
            })
            .collect()
    }

    #[test]
    fn frames_come_back_de_interleaved_in_order() {
        let (mut w, mut r) = AudioStreamBuffer::new(16, 2).unwrap();
        assert_eq!(w.write(&ramp(5, 1.0)), 5);

        let mut out = [vec![0.0; 5], vec![0.0; 5]];
        assert!(r.read(&mut out, 5));
        assert_eq!(out[0], vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(out[1], vec![-1.0, -2.0, -3.0, -4.0, -5.0]);
        assert_eq!(r.available_read(), 0);
    }

    #[test]
    fn write_past_capacity_is_rejected_entirely() {
        let (mut w, r) = AudioStreamBuffer::new(8, 2).unwrap();
        assert_eq!(w.write(&ramp(9, 0.0)), 0);
        assert_eq!(w.available_write(), 8);
        assert_eq!(r.available_read(), 0);

        assert_eq!(w.write(&ramp(6, 0.0)), 6);
        assert_eq!(w.write(&ramp(3, 0.0)), 0);
        assert_eq!(r.available_read(), 6);
    }

    #[test]
    fn partial_frames_are_rejected() {
        let (mut w, _r) = AudioStreamBuffer::new(8, 2).unwrap();
        assert_eq!(w.write(&[0.5, 0.5, 0.5]), 0);
        assert_eq!(w.available_read(), 0);
    }

    #[test]
    fn underrun_consumes_nothing() {
        let (mut w, mut r) = AudioStreamBuffer::new(8, 2).unwrap();
        assert_eq!(w.write(&ramp(3, 10.0)), 3);

        let mut out = [[0.0f32; 4], [0.0f32; 4]];
        assert!(!r.read(&mut out, 4));
        assert_eq!(r.available_read(), 3);
        assert_eq!(out, [[0.0; 4], [0.0; 4]]);

        assert!(r.read(&mut out, 3));
        assert_eq!(&out[0][..3], &[10.0, 11.0, 12.0]);
    }

    #[test]
    fn reads_and_writes_straddle_the_boundary() {
        let (mut w, mut r) = AudioStreamBuffer::new(8, 2).unwrap();
        let mut out = [vec![0.0; 8], vec![0.0; 8]];
        let mut next = 0.0;

        for _ in 0..10 {
            assert_eq!(w.write(&ramp(5, next)), 5);
            assert!(r.read(&mut out, 5));
            let expected: Vec<f32> = (0..5).map(|i| next + i as f32).collect();
            assert_eq!(&out[0][..5], &expected[..]);
            next += 5.0;
        }
    }

    #[test]
    fn mismatched_output_layout_fails() {
        let (mut w, mut r) = AudioStreamBuffer::new(8, 2).unwrap();
        w.write(&ramp(4, 0.0));

        let mut mono = [vec![0.0; 4]];
        assert!(!r.read(&mut mono, 4));
        let mut short = [vec![0.0; 2], vec![0.0; 2]];
        assert!(!r.read(&mut short, 4));
        assert_eq!(r.available_read(), 4);
    }

    #[test]
    fn both_halves_agree_on_occupancy() {
        let (mut w, mut r) = AudioStreamBuffer::new(32, 2).unwrap();
        let mut out = [vec![0.0; 32], vec![0.0; 32]];
        for n in [3usize, 7, 1, 12, 9] {
            w.write(&ramp(n, 0.0));
            assert_eq!(w.available_read() + w.available_write(), 32);
            assert_eq!(r.available_read() + r.available_write(), 32);
            r.read(&mut out, n / 2);
        }
    }
}
