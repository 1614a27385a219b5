//! Timeout representation and deadline arithmetic.
//!
//! Every blocking operation in this crate takes a [`Timeout`]. `Forever`
//! blocks indefinitely, `After(Duration::ZERO)` polls without blocking, and
//! `Until` names a point on the monotonic clock. A timeout is resolved once
//! at call entry into a [`Deadline`], which wait loops re-query for the time
//! remaining after each partial wait.

use std::time::{Duration, Instant};

/// How long a blocking call is allowed to wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
   /// Wait until the operation completes, however long that takes.
   Forever,
   /// Wait at most this long, measured from the start of the call.
   After(Duration),
   /// Wait until this point on the monotonic clock.
   Until(Instant),
}

impl Timeout {
   /// A timeout that never blocks: check once and return immediately.
   #[inline]
   #[must_use]
   pub const fn poll() -> Self {
      Self::After(Duration::ZERO)
   }
}

impl From<Duration> for Timeout {
   #[inline]
   fn from(d: Duration) -> Self {
      Self::After(d)
   }
}

impl From<Instant> for Timeout {
   #[inline]
   fn from(at: Instant) -> Self {
      Self::Until(at)
   }
}

impl From<Option<Duration>> for Timeout {
   /// An absent timeout waits forever.
   #[inline]
   fn from(d: Option<Duration>) -> Self {
      match d {
         Some(d) => Self::After(d),
         None => Self::Forever,
      }
   }
}

/// A timeout resolved against the monotonic clock at the start of a call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
   /// Resolves `timeout` now, anchoring relative timeouts to the current instant.
   pub(crate) fn start(timeout: Timeout) -> Self {
      Self(match timeout {
         Timeout::Forever => None,
         // A relative timeout too large for the clock is as good as unbounded.
         Timeout::After(d) => Instant::now().checked_add(d),
         Timeout::Until(at) => Some(at),
      })
   }

   /// An already-expired deadline, for zero-timeout park calls.
   pub(crate) fn elapsed() -> Self {
      Self(Some(Instant::now()))
   }

   /// The absolute expiry instant, or `None` for an unbounded wait.
   #[inline]
   pub(crate) fn instant(&self) -> Option<Instant> {
      self.0
   }

   /// Time left before expiry. `None` means unbounded; `Some(ZERO)` means expired.
   #[inline]
   pub(crate) fn remaining(&self) -> Option<Duration> {
      self.0.map(|at| at.saturating_duration_since(Instant::now()))
   }
}
