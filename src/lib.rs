//! Low-level, pthread-style threading primitives built directly on kernel
//! wait/wake, for language runtimes and libraries that cannot depend on a
//! bundled libc threading layer.
//!
//! Two subsystems carry the weight:
//!
//! - [`OnceFlag`]: a lock-free one-time-initialization guard, a single
//!   packed atomic word granting exactly one initializer among concurrent
//!   callers, with timeouts, waiter hand-off on failure, and a broadcast on
//!   success. [`Once<T>`] layers a value cell on top.
//! - [`Thread`]: a reference-counted thread control block bridging a user
//!   start routine, OS thread creation, thread-local self-registration, and
//!   join/teardown, including the distinguished, never-freed block for the
//!   process's initial thread.
//!
//! Both park on addresses through `parking_lot_core` and share one timeout
//! representation: [`Timeout`], where absent means wait forever and zero
//! means poll.
//!
//! # Features
//!
//! - **Lock-free fast paths**: a released flag costs one acquire load; all
//!   state transitions are single-word compare-and-swap or exchange.
//! - **Timeouts everywhere**: every blocking call takes a [`Timeout`], and a
//!   timed-out wait never swallows a wake meant for someone else.
//! - **No poisoning**: a failed initialization hands the flag to the next
//!   waiter instead of wedging it.
//!
//! # Examples
//!
//! One-time initialization with explicit roles:
//!
//! ```
//! use threadbare::{OnceFlag, OnceWait, Timeout};
//!
//! static READY: OnceFlag = OnceFlag::new();
//!
//! match READY.wait(Timeout::Forever) {
//!    OnceWait::Initializer => {
//!       // ... initialize the shared resource ...
//!       READY.release();
//!    }
//!    OnceWait::Ready => { /* initialized by someone else */ }
//!    OnceWait::TimedOut => unreachable!(),
//! }
//! ```
//!
//! Spawning and joining a thread with an inline payload:
//!
//! ```
//! use threadbare::{JoinWait, Thread, Timeout};
//!
//! fn greet(t: &Thread) {
//!    assert_eq!(t.data(), b"hi");
//! }
//!
//! let t = Thread::new(greet, b"hi").unwrap();
//! assert_eq!(t.wait(Timeout::Forever), JoinWait::Finished);
//! ```

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("threadbare needs futex and per-thread nice values; only Linux-family targets are supported");

/// Error taxonomy.
mod error;

/// The one-time-initialization flag.
mod flag;

/// Value cell guarded by the flag.
mod once;

/// Shim over the address-keyed wait/wake primitive.
mod park;

/// Timeout representation and deadline arithmetic.
mod timeout;

/// Thread control blocks and the operations on them.
pub mod thread;

/// Console-interrupt bridge backing the interruptible sleep.
mod interrupt;

/// Process-termination tiers.
pub mod exit;

pub use error::Error;
pub use flag::{OnceFlag, OnceWait};
pub use once::Once;
pub use thread::{JoinWait, Priority, Sleep, Thread, ThreadProc};
pub use timeout::Timeout;
