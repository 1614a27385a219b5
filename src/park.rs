//! Shim over the address-keyed kernel wait/wake primitive.
//!
//! `parking_lot_core` supplies the queue: a thread blocks on the address of
//! an atomic word and another thread wakes it by that same address. All
//! blocking on crate-owned words funnels through these wrappers.

use std::time::Instant;

use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

/// Outcome of a single park call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Park {
   /// A wake arrived, or the state changed before we went to sleep.
   /// Either way the caller must recheck.
   Woken,
   /// The deadline elapsed with no wake consumed.
   TimedOut,
}

/// Blocks on the address of `word` until a wake arrives or `deadline` passes.
///
/// `validate` runs under the queue lock immediately before sleeping;
/// returning `false` aborts the park, which counts as a wake.
pub(crate) fn wait_on<T>(
   word: &T,
   validate: impl FnOnce() -> bool,
   deadline: Option<Instant>,
) -> Park {
   // SAFETY: the key is the address of caller-owned memory, and both
   // callbacks are short and do not reenter the parking lot.
   let result = unsafe {
      parking_lot_core::park(
         word as *const T as usize,
         validate,
         || {},
         |_, _| {},
         DEFAULT_PARK_TOKEN,
         deadline,
      )
   };
   match result {
      ParkResult::TimedOut => Park::TimedOut,
      ParkResult::Unparked(_) | ParkResult::Invalid => Park::Woken,
   }
}

/// Wakes at most one thread parked on the address of `word`. The `consumed`
/// callback runs under the queue lock, and only when a sleeper was actually
/// dequeued. Wakes are never issued into the void, so bookkeeping tied to a
/// delivered wake goes here.
pub(crate) fn wake_one_with<T>(word: &T, consumed: impl FnOnce()) {
   // SAFETY: the key mirrors the one used by `wait_on`.
   unsafe {
      parking_lot_core::unpark_one(word as *const T as usize, |result| {
         if result.unparked_threads != 0 {
            consumed();
         }
         DEFAULT_UNPARK_TOKEN
      });
   }
}

/// Wakes every thread parked on the address of `word`, returning the count.
pub(crate) fn wake_all<T>(word: &T) -> usize {
   // SAFETY: the key mirrors the one used by `wait_on`.
   unsafe { parking_lot_core::unpark_all(word as *const T as usize, DEFAULT_UNPARK_TOKEN) }
}
