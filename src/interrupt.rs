//! Console-interrupt bridge for the interruptible sleep call.
//!
//! A process-wide generation word stands in for the interrupt condition
//! variable. The `SIGINT` handler does only async-signal-safe work: bump the
//! generation and futex-wake every sleeper. Sleepers wait on the word with
//! the raw futex call rather than the parking lot, because a wake issued
//! from a signal handler must not touch user-space queue locks.
//!
//! Handler registration is scoped to the set of live sleepers: the first
//! installs it (saving the previous disposition), the last restores it, and
//! an RAII guard makes deregistration unconditional on every exit path.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::Error;
use crate::thread::Sleep;
use crate::timeout::{Deadline, Timeout};

/// Interrupt generation counter, bumped by the signal handler.
static GENERATION: AtomicU32 = AtomicU32::new(0);

struct HandlerState {
   sleepers: usize,
   saved: Option<libc::sigaction>,
}

static HANDLER: Mutex<HandlerState> = Mutex::new(HandlerState {
   sleepers: 0,
   saved: None,
});

fn handler_state() -> MutexGuard<'static, HandlerState> {
   // Poisoning is irrelevant here; the state is two plain fields.
   HANDLER.lock().unwrap_or_else(|e| e.into_inner())
}

extern "C" fn on_interrupt(_sig: libc::c_int) {
   GENERATION.fetch_add(1, Ordering::Relaxed);
   // SAFETY: one futex syscall; async-signal-safe.
   unsafe {
      libc::syscall(
         libc::SYS_futex,
         GENERATION.as_ptr(),
         libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
         libc::c_int::MAX,
      );
   }
}

/// Scoped handler registration, shared by all concurrent sleepers.
struct Registration;

impl Registration {
   fn install() -> Result<Self, Error> {
      let mut st = handler_state();
      if st.sleepers == 0 {
         // SAFETY: installing a handler that performs only
         // async-signal-safe operations; the previous disposition is kept
         // for restoration.
         unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = on_interrupt as libc::sighandler_t;
            libc::sigemptyset(&mut sa.sa_mask);
            let mut old: libc::sigaction = mem::zeroed();
            if libc::sigaction(libc::SIGINT, &sa, &mut old) != 0 {
               return Err(Error::Os(io::Error::last_os_error()));
            }
            st.saved = Some(old);
         }
      }
      st.sleepers += 1;
      Ok(Self)
   }
}

impl Drop for Registration {
   fn drop(&mut self) {
      let mut st = handler_state();
      st.sleepers -= 1;
      if st.sleepers == 0 {
         if let Some(old) = st.saved.take() {
            // SAFETY: restoring the disposition saved at installation.
            unsafe { libc::sigaction(libc::SIGINT, &old, ptr::null_mut()) };
         }
      }
   }
}

/// Waits on the generation word until it moves past `expected` or the
/// timeout elapses. Spurious returns are fine; the caller rechecks.
fn futex_wait(expected: u32, timeout: Option<Duration>) -> Result<(), Error> {
   let ts;
   let ts_ptr = match timeout {
      Some(d) => {
         ts = libc::timespec {
            tv_sec: d.as_secs().min(i64::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
         };
         &ts as *const libc::timespec
      }
      None => ptr::null(),
   };
   // SAFETY: the word outlives the call; the timespec, when present, is live
   // across it.
   let rc = unsafe {
      libc::syscall(
         libc::SYS_futex,
         GENERATION.as_ptr(),
         libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
         expected,
         ts_ptr,
      )
   };
   if rc == 0 {
      return Ok(());
   }
   let err = io::Error::last_os_error();
   match err.raw_os_error() {
      // Timed out, the word already moved, or a signal arrived; the caller
      // rechecks the generation in every case.
      Some(libc::ETIMEDOUT) | Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(()),
      _ => Err(Error::Os(err)),
   }
}

/// Blocks until a console interrupt or the timeout, whichever first.
pub(crate) fn sleep(timeout: Timeout) -> Result<Sleep, Error> {
   let deadline = Deadline::start(timeout);
   let start_gen = GENERATION.load(Ordering::Relaxed);
   let _registration = Registration::install()?;
   loop {
      if GENERATION.load(Ordering::Relaxed) != start_gen {
         return Ok(Sleep::Interrupted);
      }
      let remaining = deadline.remaining();
      if remaining == Some(Duration::ZERO) {
         return Ok(Sleep::Completed);
      }
      futex_wait(start_gen, remaining)?;
   }
}
