//! Interrupting long-running work from another task
//!
//! A request handler that starts interruptible work owns an [`InterruptSlot`].
//! The task reading control messages calls [`InterruptSlot::interrupt`]; the
//! task doing the work calls [`arm`](InterruptSlot::arm) once it has a handle to
//! interrupt and [`disarm`](InterruptSlot::disarm) when it is done. An
//! interrupt that arrives before the work is armed is remembered and delivered
//! as soon as it is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Something that can be asked to stop
pub trait Interrupt {
    fn interrupt(&self);
}

/// A shared flag that work polls to see whether it should stop
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Interrupt for CancelToken {
    fn interrupt(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Result of [`InterruptSlot::interrupt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Nothing is armed yet; the interrupt is delivered on `arm`.
    Queued,
    /// The armed handle was interrupted.
    Delivered,
    /// The work was already interrupted or has finished.
    Ignored,
}

/// Result of [`InterruptSlot::arm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    Armed,
    /// An interrupt was queued earlier and has now been delivered.
    Interrupted,
}

#[derive(Debug)]
enum SlotState<H> {
    Idle,
    Pending,
    Armed(H),
    Fired,
    Finished { interrupted: bool },
}

/// Per-request interrupt registration
///
/// Single use: once disarmed the slot ignores further interrupts.
#[derive(Debug)]
pub struct InterruptSlot<H> {
    state: Mutex<SlotState<H>>,
}

impl<H> Default for InterruptSlot<H> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
        }
    }
}

impl<H: Interrupt> InterruptSlot<H> {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SlotState<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the work to stop
    pub fn interrupt(&self) -> InterruptOutcome {
        let mut state = self.state();
        match std::mem::replace(&mut *state, SlotState::Fired) {
            SlotState::Idle | SlotState::Pending => {
                *state = SlotState::Pending;
                InterruptOutcome::Queued
            }
            SlotState::Armed(handle) => {
                handle.interrupt();
                tracing::debug!("interrupt delivered");
                InterruptOutcome::Delivered
            }
            SlotState::Fired => InterruptOutcome::Ignored,
            finished @ SlotState::Finished { .. } => {
                *state = finished;
                InterruptOutcome::Ignored
            }
        }
    }

    /// Register the handle for the running work
    ///
    /// If an interrupt was queued, the handle is interrupted right away. Arming
    /// a slot that was already armed or finished does nothing and reports
    /// `Armed`.
    pub fn arm(&self, handle: H) -> ArmOutcome {
        let mut state = self.state();
        match *state {
            SlotState::Idle => {
                *state = SlotState::Armed(handle);
                ArmOutcome::Armed
            }
            SlotState::Pending => {
                handle.interrupt();
                *state = SlotState::Fired;
                tracing::debug!("queued interrupt delivered on arm");
                ArmOutcome::Interrupted
            }
            SlotState::Fired => {
                handle.interrupt();
                ArmOutcome::Interrupted
            }
            SlotState::Armed(_) | SlotState::Finished { .. } => ArmOutcome::Armed,
        }
    }

    /// Mark the work finished; returns whether it was interrupted
    pub fn disarm(&self) -> bool {
        let mut state = self.state();
        let interrupted = match *state {
            SlotState::Idle | SlotState::Armed(_) => false,
            SlotState::Pending | SlotState::Fired => true,
            SlotState::Finished { interrupted } => interrupted,
        };
        *state = SlotState::Finished { interrupted };
        interrupted
    }

    pub fn is_finished(&self) -> bool {
        matches!(*self.state(), SlotState::Finished { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Counter(Arc<std::sync::atomic::AtomicUsize>);

    impl Counter {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Interrupt for Counter {
        fn interrupt(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_interrupt_while_armed() {
        let slot = InterruptSlot::new();
        let counter = Counter::default();

        assert_eq!(slot.arm(counter.clone()), ArmOutcome::Armed);
        assert_eq!(slot.interrupt(), InterruptOutcome::Delivered);
        assert_eq!(slot.interrupt(), InterruptOutcome::Ignored);
        assert_eq!(counter.count(), 1);
        assert!(slot.disarm());
    }

    #[test]
    fn test_interrupt_before_arm_is_delivered_once() {
        let slot = InterruptSlot::new();
        let counter = Counter::default();

        assert_eq!(slot.interrupt(), InterruptOutcome::Queued);
        assert_eq!(slot.interrupt(), InterruptOutcome::Queued);
        assert_eq!(slot.arm(counter.clone()), ArmOutcome::Interrupted);
        assert_eq!(slot.interrupt(), InterruptOutcome::Ignored);
        assert_eq!(counter.count(), 1);
        assert!(slot.disarm());
    }

    #[test]
    fn test_interrupt_after_finish_is_ignored() {
        let slot = InterruptSlot::new();
        let counter = Counter::default();

        slot.arm(counter.clone());
        assert!(!slot.disarm());
        assert!(slot.is_finished());
        assert_eq!(slot.interrupt(), InterruptOutcome::Ignored);
        assert_eq!(counter.count(), 0);
        assert!(!slot.disarm());
    }

    #[test]
    fn test_cancel_token() {
        let slot = InterruptSlot::new();
        let token = CancelToken::new();

        slot.arm(token.clone());
        assert!(!token.is_cancelled());
        slot.interrupt();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_concurrent_interrupts_deliver_once() {
        let slot = Arc::new(InterruptSlot::new());
        let counter = Counter::default();
        slot.arm(counter.clone());

        let delivered: usize = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || slot.interrupt() == InterruptOutcome::Delivered)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();

        assert_eq!(delivered, 1);
        assert_eq!(counter.count(), 1);
    }
}
