//! # Pending Bytes Budget
//!
//! Lock-free accounting of payload bytes queued for a writer that has not yet
//! written them. A producer reserves bytes with [`ByteBudget::try_acquire`]
//! before queueing and gets back a [`BytePermit`]; the bytes are returned when
//! the permit is dropped, which happens once the writer has consumed the frame
//! or the queue holding it is torn down.
//!
//! The budget never blocks and never evicts. A reservation that would exceed
//! the capacity is refused, and the caller reports the refusal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A fixed-capacity byte counter shared by producers and writers.
#[derive(Debug)]
pub struct ByteBudget {
    capacity: u64,
    in_use: AtomicU64,
}

impl ByteBudget {
    /// Creates a budget of `capacity` bytes.
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            in_use: AtomicU64::new(0),
        })
    }

    /// Reserves `bytes`, or returns `None` if that would exceed the capacity.
    ///
    /// A single reservation larger than the whole capacity is always refused.
    pub fn try_acquire(self: &Arc<Self>, bytes: u64) -> Option<BytePermit> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(bytes)
                    .filter(|next| *next <= self.capacity)
            })
            .ok()?;
        Some(BytePermit {
            budget: Arc::clone(self),
            bytes,
        })
    }

    /// Bytes currently reserved.
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }

    /// The configured capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Bytes held against a [`ByteBudget`], released on drop.
#[derive(Debug)]
pub struct BytePermit {
    budget: Arc<ByteBudget>,
    bytes: u64,
}

impl BytePermit {
    /// Size of the reservation.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for BytePermit {
    fn drop(&mut self) {
        self.budget.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_past_capacity_and_recovers_on_release() {
        let budget = ByteBudget::new(10);
        let a = budget.try_acquire(6).unwrap();
        assert!(budget.try_acquire(5).is_none());
        let b = budget.try_acquire(4).unwrap();
        assert_eq!(budget.in_use(), 10);

        drop(a);
        assert_eq!(budget.in_use(), 4);
        assert!(budget.try_acquire(6).is_some());
        drop(b);
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn oversized_request_is_refused_outright() {
        let budget = ByteBudget::new(10);
        assert!(budget.try_acquire(11).is_none());
        assert_eq!(budget.in_use(), 0);
    }

    #[test]
    fn concurrent_reservations_never_overshoot() {
        let budget = ByteBudget::new(1_000);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..500 {
                        if let Some(p) = budget.try_acquire(7) {
                            assert!(budget.in_use() <= budget.capacity());
                            held.push(p);
                        }
                        if held.len() > 10 {
                            held.clear();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(budget.in_use(), 0);
    }
}
