//! A value cell guarded by an [`OnceFlag`].
//!
//! [`Once<T>`] stores a value written exactly once, with a lock-free fast
//! path for readers. The flag's releasing exchange publishes the cell write
//! to every thread that observes the ready state with an acquire load; the
//! cell itself adds no synchronization of its own.
//!
//! Initialization is not poisoned: if the initializing closure fails or
//! panics, the flag is reopened and the next caller retries.

use std::cell::UnsafeCell;
use std::{fmt, mem};

use crate::flag::{OnceFlag, OnceWait};
use crate::timeout::Timeout;

/// A thread-safe cell which can be written to only once.
pub struct Once<T> {
   value: UnsafeCell<mem::MaybeUninit<T>>,
   flag: OnceFlag,
}

/// Scope guard for the initializer role. Dropping it without committing
/// aborts the flag, handing initialization off to the next waiter.
struct InitGuard<'a> {
   flag: &'a OnceFlag,
}

impl InitGuard<'_> {
   /// Commits initialization and consumes the guard.
   #[inline]
   fn commit(self) {
      self.flag.release();
      mem::forget(self);
   }
}

impl Drop for InitGuard<'_> {
   #[inline]
   fn drop(&mut self) {
      self.flag.abort();
   }
}

impl<T> Once<T> {
   /// Creates a new, uninitialized cell.
   #[inline]
   #[must_use]
   pub const fn new() -> Self {
      Self {
         value: UnsafeCell::new(mem::MaybeUninit::uninit()),
         flag: OnceFlag::new(),
      }
   }

   /// Creates a cell that is already initialized with `value`.
   #[inline]
   #[must_use]
   pub const fn with_value(value: T) -> Self {
      Self {
         value: UnsafeCell::new(mem::MaybeUninit::new(value)),
         flag: OnceFlag::ready(),
      }
   }

   /// Whether the cell has been initialized. Never blocks.
   #[inline]
   pub fn is_ready(&self) -> bool {
      self.flag.is_ready()
   }

   /// Returns the contained value if initialized. Never blocks.
   #[inline]
   pub fn get(&self) -> Option<&T> {
      if self.is_ready() {
         // SAFETY: is_ready() pairs with the releasing exchange, so the
         // value is initialized and visible.
         Some(unsafe { self.get_unchecked() })
      } else {
         None
      }
   }

   /// Returns the contained value mutably if initialized. Never blocks.
   #[inline]
   pub fn get_mut(&mut self) -> Option<&mut T> {
      if self.is_ready() {
         // SAFETY: initialized, and we have exclusive access.
         Some(unsafe { (*self.value.get()).assume_init_mut() })
      } else {
         None
      }
   }

   /// Attempts to initialize the cell with `value` without blocking.
   ///
   /// Fails, returning `value`, if the cell is already initialized or
   /// another thread currently holds the initializer role.
   pub fn try_set(&self, value: T) -> Result<&T, T> {
      match self.flag.wait(Timeout::poll()) {
         OnceWait::Initializer => {
            // SAFETY: the initializer role grants exclusive write access.
            let refv = unsafe { (*self.value.get()).write(value) };
            self.flag.release();
            Ok(refv)
         }
         OnceWait::Ready | OnceWait::TimedOut => Err(value),
      }
   }

   /// Takes the value out of the cell, leaving it uninitialized.
   pub fn take(&mut self) -> Option<T> {
      if self.is_ready() {
         self.flag.reset();
         // SAFETY: the cell was initialized and the flag has been reset
         // under exclusive access, so the slot will not be read again.
         Some(unsafe { (*self.value.get()).assume_init_read() })
      } else {
         None
      }
   }

   /// Gets the value, initializing it with `f()` if needed. Blocks while
   /// another thread initializes; `f` runs at most once across all callers.
   #[inline]
   pub fn get_or_init<F>(&self, f: F) -> &T
   where
      F: FnOnce() -> T,
   {
      if let Some(value) = self.get() {
         return value;
      }
      self.initialize(f);
      // SAFETY: initialize() only returns once the cell is committed.
      unsafe { self.get_unchecked() }
   }

   /// Gets the value, initializing it with fallible `f()` if needed.
   ///
   /// On `Err` the cell stays uninitialized and a waiting thread (or a
   /// later caller) retries with its own closure.
   pub fn get_or_try_init<F, E>(&self, f: F) -> Result<&T, E>
   where
      F: FnOnce() -> Result<T, E>,
   {
      if let Some(value) = self.get() {
         return Ok(value);
      }
      self.try_initialize(f)?;
      debug_assert!(self.is_ready());
      // SAFETY: try_initialize() succeeded, so the cell is committed.
      Ok(unsafe { self.get_unchecked() })
   }

   /// Like [`get_or_init`], but gives up after `timeout` if another thread
   /// holds the initializer role past the deadline.
   ///
   /// [`get_or_init`]: Self::get_or_init
   pub fn get_or_init_timeout<F>(&self, timeout: impl Into<Timeout>, f: F) -> Option<&T>
   where
      F: FnOnce() -> T,
   {
      match self.flag.wait(timeout) {
         // SAFETY: ready implies committed and published.
         OnceWait::Ready => Some(unsafe { self.get_unchecked() }),
         OnceWait::Initializer => {
            let guard = InitGuard { flag: &self.flag };
            // SAFETY: the initializer role grants exclusive write access.
            unsafe { (*self.value.get()).write(f()) };
            guard.commit();
            // SAFETY: committed just above.
            Some(unsafe { self.get_unchecked() })
         }
         OnceWait::TimedOut => None,
      }
   }

   /// Returns the value without checking initialization.
   ///
   /// # Safety
   ///
   /// The cell must be initialized, e.g. checked via [`Self::is_ready`].
   #[inline]
   pub unsafe fn get_unchecked(&self) -> &T {
      debug_assert!(self.is_ready());
      (*self.value.get()).assume_init_ref()
   }

   /// Cold path of [`Self::get_or_init`].
   #[cold]
   fn initialize<F>(&self, f: F)
   where
      F: FnOnce() -> T,
   {
      match self.flag.wait(Timeout::Forever) {
         OnceWait::Ready => {}
         OnceWait::Initializer => {
            // A panic in f() drops the guard, reopening the flag.
            let guard = InitGuard { flag: &self.flag };
            // SAFETY: the initializer role grants exclusive write access.
            unsafe { (*self.value.get()).write(f()) };
            guard.commit();
         }
         OnceWait::TimedOut => unreachable!("unbounded wait timed out"),
      }
   }

   /// Cold path of [`Self::get_or_try_init`].
   #[cold]
   fn try_initialize<F, E>(&self, f: F) -> Result<(), E>
   where
      F: FnOnce() -> Result<T, E>,
   {
      match self.flag.wait(Timeout::Forever) {
         OnceWait::Ready => Ok(()),
         OnceWait::Initializer => {
            let guard = InitGuard { flag: &self.flag };
            // An Err return drops the guard, reopening the flag for the
            // next caller before the error propagates.
            let value = f()?;
            // SAFETY: the initializer role grants exclusive write access.
            unsafe { (*self.value.get()).write(value) };
            guard.commit();
            Ok(())
         }
         OnceWait::TimedOut => unreachable!("unbounded wait timed out"),
      }
   }
}

// SAFETY: a shared `Once<T>` hands out `&T` across threads and moves a `T`
// written by one thread to readers on others, so both bounds are required.
unsafe impl<T: Sync + Send> Sync for Once<T> {}
// SAFETY: ownership of `T` transfers across threads via initialization and
// `take()`.
unsafe impl<T: Send> Send for Once<T> {}

impl<T> Default for Once<T> {
   #[inline]
   fn default() -> Self {
      Self::new()
   }
}

impl<T> From<T> for Once<T> {
   #[inline]
   fn from(value: T) -> Self {
      Self::with_value(value)
   }
}

impl<T: fmt::Debug> fmt::Debug for Once<T> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut d = f.debug_tuple("Once");
      match self.get() {
         Some(v) => d.field(v),
         None => d.field(&format_args!("<uninit>")),
      };
      d.finish()
   }
}

impl<T> Drop for Once<T> {
   #[inline]
   fn drop(&mut self) {
      if self.is_ready() {
         // SAFETY: initialized, exclusive access, and never read again.
         unsafe { self.value.get_mut().assume_init_drop() };
      }
   }
}
