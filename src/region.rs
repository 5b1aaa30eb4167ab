//! Fixed-size shared region with a single-producer/single-consumer header.
//!
//! A region is one block of memory split into a header (`write_index`,
//! `read_index`) and a data area of `capacity * stride` elements. Indices count
//! *units* (a byte for the control queue, a frame for the audio stream) and run
//! freely over `u32`, wrapping modulo 2^32; the slot of an index is
//! `index & (capacity - 1)`, which is why capacity must be a power of two.
//!
//! [`split`] hands out exactly one [`RegionProducer`] and one [`RegionConsumer`].
//! Neither is `Clone`, so no third party can touch the region. The producer only
//! stores `write_index`, the consumer only stores `read_index`.

use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

struct RingHeader {
    write_index: AtomicU32,
    read_index: AtomicU32,
}

pub(crate) struct SharedRegion<T> {
    header: RingHeader,
    capacity: u32,
    stride: usize,
    data: Box<[UnsafeCell<T>]>,
}

// Safety: the producer only writes slots in `[write, read + capacity)` and the
// consumer only reads slots in `[read, write)`. Ownership of a slot moves between
// them through the release store / acquire load of the header indices.
unsafe impl<T: Send> Sync for SharedRegion<T> {}

impl<T> SharedRegion<T> {
    #[inline]
    fn base(&self) -> *mut T {
        // UnsafeCell<T> has the same layout as T
        self.data.as_ptr() as *mut T
    }

    /// Element ranges `(start, len)` covering `units` units from index `at`,
    /// split at the wrap boundary.
    #[inline]
    fn ranges(&self, at: u32, units: usize) -> ((usize, usize), (usize, usize)) {
        let capacity = self.capacity as usize;
        let start = (at & (self.capacity - 1)) as usize;
        let first = units.min(capacity - start);
        let second = units - first;
        ((start * self.stride, first * self.stride), (0, second * self.stride))
    }
}

/// Allocates a region and splits it into its two halves.
///
/// `capacity` is in units and must be a power of two no larger than 2^31;
/// `stride` is the number of elements per unit.
pub(crate) fn split<T: Copy + Default>(
    capacity: usize,
    stride: usize,
) -> Result<(RegionProducer<T>, RegionConsumer<T>)> {
    if capacity == 0 || !capacity.is_power_of_two() || capacity > (1 << 31) {
        return Err(Error::InvalidConfig(format!(
            "region capacity {} must be a power of two in 1..=2^31",
            capacity
        )));
    }
    if stride == 0 {
        return Err(Error::InvalidConfig("region stride must be non-zero".into()));
    }

    let data: Box<[UnsafeCell<T>]> = (0..capacity * stride)
        .map(|_| UnsafeCell::new(T::default()))
        .collect();

    let region = Arc::new(SharedRegion {
        header: RingHeader {
            write_index: AtomicU32::new(0),
            read_index: AtomicU32::new(0),
        },
        capacity: capacity as u32,
        stride,
        data,
    });

    let producer = RegionProducer {
        region: region.clone(),
        write: 0,
        read_cache: Cell::new(0),
    };
    let consumer = RegionConsumer {
        region,
        read: 0,
        write_cache: Cell::new(0),
    };
    Ok((producer, consumer))
}

/// Writing half of a [`SharedRegion`].
pub(crate) struct RegionProducer<T> {
    region: Arc<SharedRegion<T>>,
    write: u32,
    /// Last observed `read_index`; never ahead of the real one.
    read_cache: Cell<u32>,
}

impl<T: Copy> RegionProducer<T> {
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.region.capacity as usize
    }

    #[inline]
    pub(crate) fn stride(&self) -> usize {
        self.region.stride
    }

    /// Units published and not yet consumed.
    #[inline]
    pub(crate) fn readable(&self) -> usize {
        let read = self.region.header.read_index.load(Ordering::Acquire);
        self.read_cache.set(read);
        self.write.wrapping_sub(read) as usize
    }

    /// Free units.
    #[inline]
    pub(crate) fn writable(&self) -> usize {
        self.capacity() - self.readable()
    }

    /// Copies `src` into the free area, `offset` units past the write index.
    ///
    /// The data stays invisible to the consumer until [`publish`](Self::publish).
    /// Returns `false` without touching the region if the copy would run past
    /// the free area last observed by `writable()`/`readable()`.
    pub(crate) fn stage(&mut self, offset: usize, src: &[T]) -> bool {
        let stride = self.region.stride;
        if src.len() % stride != 0 {
            return false;
        }
        let units = src.len() / stride;
        let free = self.capacity() - self.write.wrapping_sub(self.read_cache.get()) as usize;
        if offset + units > free {
            return false;
        }

        let at = self.write.wrapping_add(offset as u32);
        let ((a, a_len), (b, b_len)) = self.region.ranges(at, units);
        // Safety: both ranges lie inside the data area and inside the free area,
        // which the consumer does not read until the next publish.
        unsafe {
            let base = self.region.base();
            ptr::copy_nonoverlapping(src.as_ptr(), base.add(a), a_len);
            ptr::copy_nonoverlapping(src.as_ptr().add(a_len), base.add(b), b_len);
        }
        true
    }

    /// Advances the write index by `units`, publishing everything staged below it.
    #[inline]
    pub(crate) fn publish(&mut self, units: usize) {
        self.write = self.write.wrapping_add(units as u32);
        self.region
            .header
            .write_index
            .store(self.write, Ordering::Release);
    }
}

/// Reading half of a [`SharedRegion`].
pub(crate) struct RegionConsumer<T> {
    region: Arc<SharedRegion<T>>,
    read: u32,
    /// Last observed `write_index`; never ahead of the real one.
    write_cache: Cell<u32>,
}

impl<T: Copy> RegionConsumer<T> {
    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.region.capacity as usize
    }

    #[inline]
    pub(crate) fn stride(&self) -> usize {
        self.region.stride
    }

    /// Units published and not yet consumed.
    #[inline]
    pub(crate) fn readable(&self) -> usize {
        let write = self.region.header.write_index.load(Ordering::Acquire);
        self.write_cache.set(write);
        write.wrapping_sub(self.read) as usize
    }

    #[inline]
    pub(crate) fn writable(&self) -> usize {
        self.capacity() - self.readable()
    }

    /// Two slices covering `units` units starting `offset` past the read index,
    /// split at the wrap boundary.
    ///
    /// Only data published as of the last `readable()`/`writable()` call is
    /// reachable; returns `None` if the range goes past it.
    pub(crate) fn slices(&self, offset: usize, units: usize) -> Option<(&[T], &[T])> {
        let published = self.write_cache.get().wrapping_sub(self.read) as usize;
        if offset + units > published {
            return None;
        }

        let at = self.read.wrapping_add(offset as u32);
        let ((a, a_len), (b, b_len)) = self.region.ranges(at, units);
        // Safety: the range was published by the producer (acquired through
        // write_cache) and is not reused until we advance read_index.
        unsafe {
            let base = self.region.base() as *const T;
            Some((
                std::slice::from_raw_parts(base.add(a), a_len),
                std::slice::from_raw_parts(base.add(b), b_len),
            ))
        }
    }

    /// Copies `dst.len() / stride` units starting `offset` past the read index.
    pub(crate) fn peek(&self, offset: usize, dst: &mut [T]) -> bool {
        let stride = self.region.stride;
        if dst.len() % stride != 0 {
            return false;
        }
        match self.slices(offset, dst.len() / stride) {
            Some((first, second)) => {
                dst[..first.len()].copy_from_slice(first);
                dst[first.len()..].copy_from_slice(second);
                true
            }
            None => false,
        }
    }

    /// Advances the read index by `units`, handing the slots back to the producer.
    #[inline]
    pub(crate) fn release(&mut self, units: usize) {
        self.read = self.read.wrapping_add(units as u32);
        self.region
            .header
            .read_index
            .store(self.read, Ordering::Release);
    }
}
