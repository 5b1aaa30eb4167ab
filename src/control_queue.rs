//! Byte-oriented SPSC queue for note events.
//!
//! Each record is stored as `[length:1][payload:length]` where the payload is
//! `[opcode][note][velocity]` for note-on and `[opcode][note]` for note-off.
//! A record becomes visible to the consumer only once the producer has
//! published the write index past its last byte.
//!
//! Part of the capacity is held back for note-offs: a note-on is only accepted
//! if the reserve would still be free afterwards, so a burst of note-ons can
//! never starve the note-off that ends them.

use crate::error::{Error, Result};
use crate::region::{self, RegionConsumer, RegionProducer};

const OP_NOTE_ON: u8 = 0x90;
const OP_NOTE_OFF: u8 = 0x80;

/// Largest encoded payload (note-on).
const MAX_PAYLOAD: usize = 3;

/// A discrete control event carried from the control context to the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRecord {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
}

impl ControlRecord {
    /// Encodes the payload (without length prefix), returns its length.
    fn encode(&self, buf: &mut [u8; MAX_PAYLOAD]) -> usize {
        match *self {
            ControlRecord::NoteOn { note, velocity } => {
                *buf = [OP_NOTE_ON, note, velocity];
                3
            }
            ControlRecord::NoteOff { note } => {
                buf[0] = OP_NOTE_OFF;
                buf[1] = note;
                2
            }
        }
    }

    fn decode(payload: &[u8]) -> Option<Self> {
        match *payload {
            [OP_NOTE_ON, note, velocity] => Some(ControlRecord::NoteOn { note, velocity }),
            [OP_NOTE_OFF, note] => Some(ControlRecord::NoteOff { note }),
            _ => None,
        }
    }

    /// Bytes the record occupies in the queue, including the length prefix.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        match self {
            ControlRecord::NoteOn { .. } => 4,
            ControlRecord::NoteOff { .. } => 3,
        }
    }
}

/// Constructor for a control queue pair.
pub struct ControlQueue;

impl ControlQueue {
    /// Creates a queue of `capacity` bytes (a power of two) with room for
    /// `note_off_reserve` note-offs that note-ons may not use.
    pub fn new(
        capacity: usize,
        note_off_reserve: usize,
    ) -> Result<(ControlProducer, ControlConsumer)> {
        let reserve = note_off_reserve * ControlRecord::NoteOff { note: 0 }.encoded_len();
        if reserve >= capacity {
            return Err(Error::InvalidConfig(format!(
                "note-off reserve of {} bytes does not fit a {} byte control queue",
                reserve, capacity
            )));
        }

        let (producer, consumer) = region::split::<u8>(capacity, 1)?;
        Ok((
            ControlProducer {
                inner: producer,
                reserve,
            },
            ControlConsumer { inner: consumer },
        ))
    }
}

/// Producer half, owned by the control context.
pub struct ControlProducer {
    inner: RegionProducer<u8>,
    reserve: usize,
}

impl ControlProducer {
    /// Queues a record. Returns `false` if the queue is full; never blocks.
    ///
    /// Rejection leaves the queue untouched; retrying or dropping is up to the
    /// caller.
    pub fn write(&mut self, record: ControlRecord) -> bool {
        let mut record_bytes = [0u8; MAX_PAYLOAD + 1];
        let mut payload = [0u8; MAX_PAYLOAD];
        let len = record.encode(&mut payload);
        record_bytes[0] = len as u8;
        record_bytes[1..=len].copy_from_slice(&payload[..len]);
        let needed = len + 1;

        let held_back = match record {
            ControlRecord::NoteOn { .. } => self.reserve,
            ControlRecord::NoteOff { .. } => 0,
        };
        if self.inner.writable() < needed + held_back {
            return false;
        }

        if !self.inner.stage(0, &record_bytes[..needed]) {
            return false;
        }
        self.inner.publish(needed);
        true
    }

    /// Free bytes, including the note-off reserve.
    pub fn available(&self) -> usize {
        self.inner.writable()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Consumer half, owned by the synthesis worker.
pub struct ControlConsumer {
    inner: RegionConsumer<u8>,
}

impl ControlConsumer {
    /// Hands every record available right now to `visit`, in order, then
    /// releases their bytes in one index update. Returns the number visited.
    ///
    /// Records published while the drain runs are left for the next call.
    pub fn drain(&mut self, mut visit: impl FnMut(ControlRecord)) -> usize {
        let available = self.inner.readable();
        let mut cursor = 0;
        let mut visited = 0;

        while cursor < available {
            let mut len = [0u8; 1];
            if !self.inner.peek(cursor, &mut len) {
                break;
            }
            let len = len[0] as usize;
            if len == 0 || len > MAX_PAYLOAD || cursor + 1 + len > available {
                // Framing is lost; drop what is left rather than misread it.
                tracing::warn!(len, cursor, available, "corrupt control record, discarding queue tail");
                cursor = available;
                break;
            }

            let mut payload = [0u8; MAX_PAYLOAD];
            if !self.inner.peek(cursor + 1, &mut payload[..len]) {
                break;
            }
            match ControlRecord::decode(&payload[..len]) {
                Some(record) => {
                    visit(record);
                    visited += 1;
                }
                None => tracing::warn!(opcode = payload[0], "unknown control opcode"),
            }
            cursor += 1 + len;
        }

        if cursor > 0 {
            self.inner.release(cursor);
        }
        visited
    }

    /// Bytes waiting to be drained.
    pub fn pending(&self) -> usize {
        self.inner.readable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(rx: &mut ControlConsumer) -> Vec<ControlRecord> {
        let mut out = Vec::new();
        rx.drain(|r| out.push(r));
        out
    }

    #[test]
    fn records_arrive_in_order_exactly_once() {
        let (mut tx, mut rx) = ControlQueue::new(64, 0).unwrap();
        let sent = [
            ControlRecord::NoteOn { note: 60, velocity: 100 },
            ControlRecord::NoteOn { note: 64, velocity: 90 },
            ControlRecord::NoteOff { note: 60 },
            ControlRecord::NoteOff { note: 64 },
        ];
        for r in sent.iter() {
            assert!(tx.write(*r));
        }

        assert_eq!(drain_all(&mut rx), sent.to_vec());
        assert!(drain_all(&mut rx).is_empty());
        assert_eq!(tx.available(), 64);
    }

    #[test]
    fn drain_on_empty_queue_visits_nothing() {
        let (_tx, mut rx) = ControlQueue::new(16, 0).unwrap();
        assert_eq!(rx.drain(|_| panic!("nothing to visit")), 0);
    }

    #[test]
    fn full_queue_rejects_without_side_effects() {
        let (mut tx, mut rx) = ControlQueue::new(8, 0).unwrap();
        assert!(tx.write(ControlRecord::NoteOn { note: 1, velocity: 1 }));
        assert!(tx.write(ControlRecord::NoteOff { note: 1 }));
        // 7 of 8 bytes used
        assert_eq!(tx.available(), 1);
        assert!(!tx.write(ControlRecord::NoteOff { note: 2 }));
        assert_eq!(tx.available(), 1);

        assert_eq!(
            drain_all(&mut rx),
            vec![
                ControlRecord::NoteOn { note: 1, velocity: 1 },
                ControlRecord::NoteOff { note: 1 },
            ]
        );
    }

    #[test]
    fn note_ons_leave_the_reserve_for_note_offs() {
        // 32 bytes, 4 note-offs (12 bytes) reserved
        let (mut tx, mut rx) = ControlQueue::new(32, 4).unwrap();
        let mut accepted = 0;
        while tx.write(ControlRecord::NoteOn { note: accepted, velocity: 64 }) {
            accepted += 1;
        }
        // 5 note-ons = 20 bytes, a sixth would eat into the reserve
        assert_eq!(accepted, 5);
        for note in 0..4 {
            assert!(tx.write(ControlRecord::NoteOff { note }));
        }

        let records = drain_all(&mut rx);
        assert_eq!(records.len(), 9);
        assert_eq!(records[8], ControlRecord::NoteOff { note: 3 });
    }

    #[test]
    fn records_wrap_around_the_region_boundary() {
        let (mut tx, mut rx) = ControlQueue::new(8, 0).unwrap();
        for round in 0..20u8 {
            assert!(tx.write(ControlRecord::NoteOn { note: round, velocity: round }));
            assert!(tx.write(ControlRecord::NoteOff { note: round }));
            assert_eq!(
                drain_all(&mut rx),
                vec![
                    ControlRecord::NoteOn { note: round, velocity: round },
                    ControlRecord::NoteOff { note: round },
                ]
            );
        }
    }

    #[test]
    fn reserve_larger_than_queue_is_rejected() {
        assert!(ControlQueue::new(16, 6).is_err());
        assert!(ControlQueue::new(16, 5).is_ok());
    }

    #[test]
    fn concurrent_producer_and_consumer_keep_order() {
        const CAPACITY: usize = 64;
        const RECORDS: usize = 20_000;

        fn record(i: usize) -> ControlRecord {
            let note = (i % 128) as u8;
            if i % 2 == 0 {
                ControlRecord::NoteOn { note, velocity: ((i / 128) % 127 + 1) as u8 }
            } else {
                ControlRecord::NoteOff { note }
            }
        }

        let (mut tx, mut rx) = ControlQueue::new(CAPACITY, 2).unwrap();
        let producer = std::thread::spawn(move || {
            let mut rng = fastrand::Rng::with_seed(3);
            for i in 0..RECORDS {
                while !tx.write(record(i)) {
                    std::thread::yield_now();
                }
                assert!(tx.available() <= CAPACITY);
                if rng.usize(..8) == 0 {
                    std::thread::yield_now();
                }
            }
            tx
        });

        let mut rng = fastrand::Rng::with_seed(5);
        let mut received = 0;
        while received < RECORDS {
            rx.drain(|r| {
                assert_eq!(r, record(received), "record {}", received);
                received += 1;
            });
            assert!(rx.pending() <= CAPACITY);
            if rng.usize(..4) == 0 {
                std::thread::yield_now();
            }
        }

        let tx = producer.join().unwrap();
        assert_eq!(rx.drain(|_| panic!("nothing left to visit")), 0);
        assert_eq!(tx.available() + rx.pending(), CAPACITY);
        assert_eq!(tx.available(), CAPACITY);
    }
}
