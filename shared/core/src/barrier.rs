use std::sync::{Condvar, Mutex};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("barrier was cancelled")]
pub struct CancelledBarrier;

/// A rendezvous point shared by a fixed set of participants.
///
/// Unlike [`std::sync::Barrier`], a waiting participant can be released with an
/// error when another participant gives up, so a failing rank never leaves its
/// peers blocked forever.
pub trait Barrier: Send + Sync {
    fn wait(&self) -> Result<(), CancelledBarrier>;
    fn cancel(&self);
    fn reset(&self);
    fn is_cancelled(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct NopBarrier;

impl Barrier for NopBarrier {
    fn wait(&self) -> Result<(), CancelledBarrier> {
        Ok(())
    }

    fn cancel(&self) {}

    fn reset(&self) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    cancelled: bool,
}

#[derive(Debug)]
pub struct CancellableBarrier {
    participants: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl CancellableBarrier {
    pub fn new(participants: usize) -> Self {
        Self {
            participants,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                cancelled: false,
            }),
            released: Condvar::new(),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BarrierState> {
        // a participant that panicked while holding the lock only ever leaves
        // counters behind, which stay consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Barrier for CancellableBarrier {
    fn wait(&self) -> Result<(), CancelledBarrier> {
        let mut state = self.lock();
        if state.cancelled {
            return Err(CancelledBarrier);
        }

        state.arrived += 1;
        if state.arrived >= self.participants {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        while state.generation == generation && !state.cancelled {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        if state.generation == generation {
            // woken by cancellation, not by the last arrival
            Err(CancelledBarrier)
        } else {
            Ok(())
        }
    }

    fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        self.released.notify_all();
    }

    fn reset(&self) {
        let mut state = self.lock();
        state.cancelled = false;
        state.arrived = 0;
    }

    fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn releases_all_participants() {
        let barrier = Arc::new(CancellableBarrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        barrier.wait().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!barrier.is_cancelled());
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let barrier = Arc::new(CancellableBarrier::new(3));
        let waiter = {
            let barrier = barrier.clone();
            std::thread::spawn(move || barrier.wait())
        };
        // give the waiter a chance to block, then give up on the rendezvous
        std::thread::sleep(std::time::Duration::from_millis(20));
        barrier.cancel();
        assert_eq!(waiter.join().unwrap(), Err(CancelledBarrier));
        assert_eq!(barrier.wait(), Err(CancelledBarrier));

        barrier.reset();
        assert!(!barrier.is_cancelled());
    }

    #[test]
    fn single_participant_never_blocks() {
        let barrier = CancellableBarrier::new(1);
        assert_eq!(barrier.wait(), Ok(()));
        assert_eq!(NopBarrier.wait(), Ok(()));
    }
}
