//! The one-time-initialization flag.
//!
//! An [`OnceFlag`] guarantees that exactly one thread among any number of
//! concurrent callers is granted the initializer role, and broadcasts
//! completion to the rest. It is a single atomic machine word with three
//! packed sub-fields, always read and written as one unit:
//!
//! - Bit 0: READY, set once initialization has committed; terminal.
//! - Bit 1: LOCKED, set while exactly one thread is initializing.
//! - Bits 2..: SLEEPERS, a modular count of threads parked on the flag.
//!
//! The sleeper count is an approximation, not an exact census: it changes
//! only by ±1 under compare-and-swap and wraps within its field, assuming
//! the number of concurrently parked threads never exceeds the field's
//! range. It exists to decide whether a wake needs issuing at all; the wake
//! queue itself tracks who is actually asleep.
//!
//! There is no poisoned state. A failed initialization calls [`abort`],
//! which returns the flag to its starting state and hands the initializer
//! role to at most one parked waiter.
//!
//! [`abort`]: OnceFlag::abort

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::park::{self, Park};
use crate::timeout::{Deadline, Timeout};

const READY: usize = 1;
const LOCKED: usize = 1 << 1;
const SLEEPER_SHIFT: u32 = 2;
const SLEEPER_ONE: usize = 1 << SLEEPER_SHIFT;
const SLEEPER_MASK: usize = !(READY | LOCKED);

/// Number of sleepers recorded in `word`.
#[inline]
const fn sleeper_count(word: usize) -> usize {
   (word & SLEEPER_MASK) >> SLEEPER_SHIFT
}

/// The sleeper field occupies the bits above LOCKED, so whole-word wrapping
/// arithmetic keeps the counter modular without disturbing the flag bits.
#[inline]
const fn add_sleeper(word: usize) -> usize {
   word.wrapping_add(SLEEPER_ONE)
}

#[inline]
const fn sub_sleeper(word: usize) -> usize {
   word.wrapping_sub(SLEEPER_ONE)
}

/// Result of [`OnceFlag::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnceWait {
   /// Initialization has already committed; everything the initializer wrote
   /// before releasing the flag is visible to the caller.
   Ready,
   /// The caller holds the flag and must finish with [`OnceFlag::release`]
   /// on success or [`OnceFlag::abort`] on failure.
   Initializer,
   /// The timeout elapsed before initialization committed.
   TimedOut,
}

/// A lock-free guard granting exactly one initializer among concurrent
/// callers.
///
/// The flag lives in caller-owned storage and needs no allocation:
///
/// ```
/// use threadbare::{OnceFlag, OnceWait, Timeout};
///
/// static INIT: OnceFlag = OnceFlag::new();
///
/// match INIT.wait(Timeout::Forever) {
///    OnceWait::Initializer => {
///       // ... set up the protected resource ...
///       INIT.release();
///    }
///    OnceWait::Ready => { /* resource is visible */ }
///    OnceWait::TimedOut => unreachable!("unbounded wait"),
/// }
/// ```
pub struct OnceFlag {
   word: AtomicUsize,
}

/// Outcome of a sleeper retraction after a park timeout.
enum Retract {
   /// Our registration was withdrawn; the word before the decrement is kept
   /// so the caller can classify the timeout.
   Decremented(usize),
   /// The counter was already zero: a release or abort consumed our slot and
   /// earmarked a wake for us.
   Consumed,
}

impl OnceFlag {
   /// Creates a flag in the uninitialized, unlocked state.
   #[inline]
   #[must_use]
   pub const fn new() -> Self {
      Self {
         word: AtomicUsize::new(0),
      }
   }

   /// Creates a flag that is already released.
   #[inline]
   #[must_use]
   pub const fn ready() -> Self {
      Self {
         word: AtomicUsize::new(READY),
      }
   }

   /// Whether initialization has committed. Never blocks; pairs with the
   /// release in [`OnceFlag::release`], so a `true` result also publishes
   /// the initializer's writes.
   #[inline]
   pub fn is_ready(&self) -> bool {
      self.word.load(Ordering::Acquire) & READY != 0
   }

   /// Returns the flag to its starting state for reuse.
   ///
   /// Exclusive access makes the reset impossible to race with a concurrent
   /// `wait`, `release` or `abort`.
   #[inline]
   pub fn reset(&mut self) {
      *self.word.get_mut() = 0;
   }

   /// Waits for the flag, claiming the initializer role if it is free.
   ///
   /// Returns [`OnceWait::Ready`] as soon as a previous initializer has
   /// released the flag; that path is a pure load, safe to call repeatedly and
   /// concurrently. Otherwise the caller either becomes the initializer
   /// (the transition that observed LOCKED go 0→1) or parks until a
   /// release, an abort hand-off, or the timeout. Wakes carry no state;
   /// every woken thread rechecks from the top.
   pub fn wait(&self, timeout: impl Into<Timeout>) -> OnceWait {
      let deadline = Deadline::start(timeout.into());
      loop {
         let mut cur = self.word.load(Ordering::Acquire);
         loop {
            if cur & READY != 0 {
               return OnceWait::Ready;
            }
            let next = if cur & LOCKED == 0 {
               cur | LOCKED
            } else {
               add_sleeper(cur)
            };
            // Weak CAS: a spurious failure retries with the freshly observed
            // word rather than re-deriving state from scratch.
            match self
               .word
               .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
               Ok(_) => break,
               Err(seen) => cur = seen,
            }
         }

         if cur & LOCKED == 0 {
            // Our exchange took the lock.
            return OnceWait::Initializer;
         }

         // Registered as a sleeper; park until the flag leaves the
         // in-progress state. The validation runs under the queue lock, so
         // a release or abort issued between our registration and the sleep
         // aborts the park instead of being missed.
         let outcome = park::wait_on(
            &self.word,
            || {
               let w = self.word.load(Ordering::Relaxed);
               w & (READY | LOCKED) == LOCKED
            },
            deadline.instant(),
         );

         if outcome == Park::TimedOut {
            match self.retract_sleeper() {
               Retract::Decremented(prev) => {
                  // A release racing the retraction is reported as such
                  // rather than as a timeout.
                  return if prev & READY != 0 {
                     OnceWait::Ready
                  } else {
                     OnceWait::TimedOut
                  };
               }
               Retract::Consumed => {
                  // A release or abort already claimed our registration, so
                  // a wake meant for us is in flight. Absorb it with one
                  // zero-timeout park, then take another lap. Handing it
                  // back to the queue rather than dropping it keeps a later
                  // waiter from blocking on a signal that was already spent.
                  let _ = park::wait_on(&self.word, || true, Deadline::elapsed().instant());
               }
            }
         }
         // Woken or compensated: recheck the whole state.
      }
   }

   /// Commits initialization. Must be called exactly once, by the thread
   /// that obtained [`OnceWait::Initializer`], after its writes are done.
   ///
   /// The whole word is exchanged for READY with release semantics, so
   /// every thread that subsequently observes READY with an acquire load
   /// also observes the initializer's writes. All parked waiters wake.
   pub fn release(&self) {
      let prev = self.word.swap(READY, Ordering::AcqRel);
      debug_assert!(prev & LOCKED != 0, "release without holding the flag");
      if sleeper_count(prev) != 0 {
         park::wake_all(&self.word);
      }
   }

   /// Abandons initialization. Must be called by the current initializer
   /// after a failed attempt.
   ///
   /// Clears LOCKED and hands the flag off to at most one parked waiter,
   /// which retries and may itself become the next initializer. With no
   /// waiters the flag simply returns to its starting state; either way
   /// some thread can always retry.
   pub fn abort(&self) {
      let mut cur = self.word.load(Ordering::Relaxed);
      loop {
         debug_assert!(cur & LOCKED != 0, "abort without holding the flag");
         match self.word.compare_exchange_weak(
            cur,
            cur & !LOCKED,
            Ordering::Release,
            Ordering::Relaxed,
         ) {
            Ok(_) => break,
            Err(seen) => cur = seen,
         }
      }
      if sleeper_count(cur) == 0 {
         return;
      }
      // Hand-off: retire exactly one sleeper slot, and only when a sleeper
      // is actually dequeued. A waiter that registered but has not parked
      // yet keeps its slot; its park validation will bounce it instead.
      park::wake_one_with(&self.word, || {
         let mut cur = self.word.load(Ordering::Relaxed);
         loop {
            if sleeper_count(cur) == 0 {
               break;
            }
            match self.word.compare_exchange_weak(
               cur,
               sub_sleeper(cur),
               Ordering::Relaxed,
               Ordering::Relaxed,
            ) {
               Ok(_) => break,
               Err(seen) => cur = seen,
            }
         }
      });
   }

   /// Withdraws this thread's sleeper registration after a park timeout.
   fn retract_sleeper(&self) -> Retract {
      let mut cur = self.word.load(Ordering::Relaxed);
      loop {
         if sleeper_count(cur) == 0 {
            return Retract::Consumed;
         }
         // Acquire on success: the READY classification of the word we
         // decremented must pair with the releasing exchange.
         match self.word.compare_exchange_weak(
            cur,
            sub_sleeper(cur),
            Ordering::Acquire,
            Ordering::Relaxed,
         ) {
            Ok(prev) => return Retract::Decremented(prev),
            Err(seen) => cur = seen,
         }
      }
   }
}

impl Default for OnceFlag {
   #[inline]
   fn default() -> Self {
      Self::new()
   }
}

impl fmt::Debug for OnceFlag {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let word = self.word.load(Ordering::Relaxed);
      f.debug_struct("OnceFlag")
         .field("ready", &(word & READY != 0))
         .field("locked", &(word & LOCKED != 0))
         .field("sleepers", &sleeper_count(word))
         .finish()
   }
}
