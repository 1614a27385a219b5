//! Thread control blocks: creation, reference counting, join, priority,
//! self-lookup, and sleep.
//!
//! A [`Thread`] is a counted reference to a heap-allocated control block.
//! The count starts at two: one for the handle returned to the creator and
//! one for the running thread itself. The block is torn down exactly when
//! the count reaches zero, with one exception: the statically allocated
//! block representing the process's initial thread, which is counted like
//! any other but never freed.
//!
//! The running thread holds a non-owning back-reference to its own block in
//! thread-local storage, written once at startup; [`Thread::current`] turns
//! it into a counted handle on demand.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::Error;
use crate::flag::{OnceFlag, OnceWait};
use crate::interrupt;
use crate::park;
use crate::timeout::{Deadline, Timeout};

/// Entry point run on the new thread, invoked exactly once with a borrowed
/// handle to the thread's own control block.
pub type ThreadProc = fn(&Thread);

/// Alignment requests at or above this are rejected.
const MAX_DATA_ALIGN: usize = 0x1000_0000;
/// Payload sizes at or above this are rejected.
const MAX_DATA_SIZE: usize = 0x7FF0_0000;

/// Join word: set once the start procedure has returned.
const FINISHED: u32 = 1;

/// Result of [`Thread::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinWait {
   /// The target's start procedure has returned.
   Finished,
   /// The deadline passed first.
   TimedOut,
}

/// Outcome of an interruptible [`sleep`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sleep {
   /// A console interrupt cut the wait short.
   Interrupted,
   /// The timeout elapsed.
   Completed,
}

/// Scheduling priority levels, mapped onto per-thread nice values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
   Idle,
   Low,
   BelowNormal,
   Normal,
   AboveNormal,
   High,
   Realtime,
}

impl Priority {
   fn to_nice(self) -> libc::c_int {
      match self {
         Priority::Idle => 19,
         Priority::Low => 10,
         Priority::BelowNormal => 5,
         Priority::Normal => 0,
         Priority::AboveNormal => -5,
         Priority::High => -10,
         Priority::Realtime => -20,
      }
   }

   fn from_nice(nice: libc::c_int) -> Self {
      match nice {
         i32::MIN..=-16 => Priority::Realtime,
         -15..=-8 => Priority::High,
         -7..=-3 => Priority::AboveNormal,
         -2..=2 => Priority::Normal,
         3..=7 => Priority::BelowNormal,
         8..=14 => Priority::Low,
         _ => Priority::Idle,
      }
   }
}

/// Separately owned, aligned byte buffer holding the caller's payload.
struct Payload {
   ptr: NonNull<u8>,
   len: usize,
   align: usize,
}

impl Payload {
   const fn empty() -> Self {
      Self {
         ptr: NonNull::dangling(),
         len: 0,
         align: 1,
      }
   }

   fn alloc(align: usize, data: &[u8]) -> Result<Self, Error> {
      let len = data.len();
      if len == 0 {
         // No allocation; keep the alignment promise on the dangling pointer.
         let ptr = NonNull::new(align as *mut u8).unwrap_or(NonNull::dangling());
         return Ok(Self { ptr, len: 0, align });
      }
      let layout = Layout::from_size_align(len, align)
         .map_err(|_| Error::InvalidArgument("payload layout"))?;
      // SAFETY: len is nonzero, so the layout is nonzero-sized.
      let raw = unsafe { alloc::alloc_zeroed(layout) };
      let Some(ptr) = NonNull::new(raw) else {
         return Err(Error::OutOfMemory);
      };
      // SAFETY: freshly allocated region of at least `len` bytes.
      unsafe { ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), len) };
      Ok(Self { ptr, len, align })
   }
}

impl Drop for Payload {
   fn drop(&mut self) {
      if self.len != 0 {
         // SAFETY: allocated in `alloc` with this exact layout.
         unsafe {
            alloc::dealloc(
               self.ptr.as_ptr(),
               Layout::from_size_align_unchecked(self.len, self.align),
            );
         }
      }
   }
}

/// The control block proper. Shared through raw pointers and the atomic
/// reference count; every field is either atomic or written once before the
/// block becomes visible to a second thread.
struct Inner {
   /// Two at birth: the creator's handle plus the running thread itself.
   nref: AtomicU32,
   /// Join word, parked on by [`Thread::wait`].
   state: AtomicU32,
   /// Kernel thread id, published by the new thread before anything else.
   tid: AtomicI32,
   /// pthread identifier. The creator stores it right after spawning and
   /// the new thread stores the same value at startup; the double write is
   /// idempotent and benign.
   os: AtomicUsize,
   proc_: ThreadProc,
   data: Payload,
}

// SAFETY: all mutable state is atomic; `proc_` and `data` are immutable
// after construction, and payload aliasing rules are the caller's contract
// (see `Thread::data`).
unsafe impl Sync for Inner {}
unsafe impl Send for Inner {}

fn initial_thread_proc(_: &Thread) {}

/// Control block for the process's initial thread. Reference-counted like
/// any other block but never freed or detached.
static MAIN_BLOCK: Inner = Inner {
   nref: AtomicU32::new(0),
   state: AtomicU32::new(0),
   tid: AtomicI32::new(0),
   os: AtomicUsize::new(0),
   proc_: initial_thread_proc,
   data: Payload::empty(),
};

static MAIN_ATTACH: OnceFlag = OnceFlag::new();

thread_local! {
   /// Non-owning back-reference from the running thread to its block.
   /// Written once at thread start, never again.
   static SELF: Cell<*const Inner> = const { Cell::new(ptr::null()) };
}

/// Live control blocks, for teardown accounting in the unit tests.
#[cfg(test)]
static LIVE_BLOCKS: AtomicUsize = AtomicUsize::new(0);

/// Sentinel unwind payload used by [`exit_current`] to return control to
/// the spawn shim.
struct ThreadExit;

/// A counted reference to a thread control block.
pub struct Thread {
   inner: NonNull<Inner>,
}

// SAFETY: the block is shared state guarded by atomics; handles may move
// and be used across threads freely.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
   /// Spawns a thread running `proc_`, with `data` copied into the block at
   /// the default payload alignment.
   pub fn new(proc_: ThreadProc, data: &[u8]) -> Result<Self, Error> {
      Self::new_aligned(proc_, 16, data)
   }

   /// Spawns a thread running `proc_`, with `data` copied into the block at
   /// the requested alignment.
   ///
   /// The new thread records its own ids, installs itself as the
   /// thread-local current thread, and invokes `proc_` exactly once. The
   /// returned handle carries one of the block's two initial references;
   /// the running thread owns the other and drops it when `proc_` returns.
   pub fn new_aligned(proc_: ThreadProc, align: usize, data: &[u8]) -> Result<Self, Error> {
      if !align.is_power_of_two() {
         return Err(Error::InvalidArgument("alignment must be a power of two"));
      }
      if align >= MAX_DATA_ALIGN {
         return Err(Error::InvalidArgument("alignment too large"));
      }
      if data.len() >= MAX_DATA_SIZE {
         return Err(Error::InvalidArgument("payload too large"));
      }

      let inner = Box::new(Inner {
         nref: AtomicU32::new(2),
         state: AtomicU32::new(0),
         tid: AtomicI32::new(0),
         os: AtomicUsize::new(0),
         proc_,
         data: Payload::alloc(align, data)?,
      });
      let raw = Box::into_raw(inner);
      #[cfg(test)]
      LIVE_BLOCKS.fetch_add(1, Ordering::Relaxed);

      let mut handle: libc::pthread_t = 0;
      // SAFETY: thread_thunk matches the expected C signature and receives
      // the raw block pointer, whose running-thread reference it adopts.
      let rc = unsafe {
         libc::pthread_create(&mut handle, ptr::null(), thread_thunk, raw.cast())
      };
      if rc != 0 {
         // SAFETY: the thread never started, so both references are still
         // ours to reclaim.
         #[cfg(test)]
         LIVE_BLOCKS.fetch_sub(1, Ordering::Relaxed);
         drop(unsafe { Box::from_raw(raw) });
         return Err(Error::Os(io::Error::from_raw_os_error(rc)));
      }

      // The new thread stores the same value in its first instructions;
      // whichever write lands second changes nothing.
      // SAFETY: the block stays alive; we hold the creator's reference.
      unsafe { (*raw).os.store(handle as usize, Ordering::Relaxed) };

      // SAFETY: Box::into_raw never returns null.
      Ok(Self {
         inner: unsafe { NonNull::new_unchecked(raw) },
      })
   }

   /// The calling thread's control block, or `None` on a thread that was
   /// never attached (a foreign thread, or one not created here).
   pub fn current() -> Option<Self> {
      let p = SELF.get();
      if p.is_null() {
         return None;
      }
      // SAFETY: the back-reference is only readable while the thread runs
      // inside its start procedure, where the block holds its own
      // reference, so the pointer is live.
      unsafe { (*p).retain() };
      Some(Self {
         // SAFETY: checked non-null above.
         inner: unsafe { NonNull::new_unchecked(p.cast_mut()) },
      })
   }

   /// Adopts the calling thread as the process's initial thread and returns
   /// a handle to its distinguished static block.
   ///
   /// The first call attaches; later calls (from any thread) just hand out
   /// another reference. The static block's count may reach zero without
   /// consequence; it is never freed.
   pub fn attach_main() -> Self {
      match MAIN_ATTACH.wait(Timeout::Forever) {
         OnceWait::Initializer => {
            // Same birth count as a spawned block: the running thread
            // itself plus the handle returned below.
            MAIN_BLOCK.nref.store(2, Ordering::Relaxed);
            MAIN_BLOCK
               .os
               .store(unsafe { libc::pthread_self() } as usize, Ordering::Relaxed);
            MAIN_BLOCK
               .tid
               .store(unsafe { libc::gettid() }, Ordering::Relaxed);
            SELF.set(&MAIN_BLOCK);
            MAIN_ATTACH.release();
         }
         OnceWait::Ready => MAIN_BLOCK.retain(),
         OnceWait::TimedOut => unreachable!("unbounded wait timed out"),
      }
      Self {
         inner: NonNull::from(&MAIN_BLOCK),
      }
   }

   /// Blocks until the target thread's start procedure has returned, or the
   /// timeout elapses. Zero polls, absent waits forever. Reference counts
   /// are not touched; joining is orthogonal to ownership.
   pub fn wait(&self, timeout: impl Into<Timeout>) -> JoinWait {
      let deadline = Deadline::start(timeout.into());
      let state = &self.inner().state;
      loop {
         if state.load(Ordering::Acquire) & FINISHED != 0 {
            return JoinWait::Finished;
         }
         let outcome = park::wait_on(
            state,
            || state.load(Ordering::Relaxed) & FINISHED == 0,
            deadline.instant(),
         );
         if outcome == park::Park::TimedOut {
            // One more look: finishing may have raced the timeout.
            return if state.load(Ordering::Acquire) & FINISHED != 0 {
               JoinWait::Finished
            } else {
               JoinWait::TimedOut
            };
         }
      }
   }

   /// Whether the start procedure has returned. Never blocks.
   pub fn has_finished(&self) -> bool {
      self.inner().state.load(Ordering::Acquire) & FINISHED != 0
   }

   /// The underlying pthread identifier.
   pub fn os_id(&self) -> u64 {
      self.inner().os.load(Ordering::Relaxed) as u64
   }

   /// Shared view of the payload copied in at creation.
   ///
   /// The bytes are also writable through [`Self::data_ptr`]; callers that
   /// mix the two are responsible for not reading and writing concurrently.
   pub fn data(&self) -> &[u8] {
      let inner = self.inner();
      if inner.data.len == 0 {
         return &[];
      }
      // SAFETY: the payload allocation lives as long as the block.
      unsafe { slice::from_raw_parts(inner.data.ptr.as_ptr(), inner.data.len) }
   }

   /// Raw pointer to the payload, for start procedures that write results
   /// back for the creator to read after a successful [`Self::wait`].
   pub fn data_ptr(&self) -> *mut u8 {
      self.inner().data.ptr.as_ptr()
   }

   /// Payload size in bytes.
   pub fn data_len(&self) -> usize {
      self.inner().data.len
   }

   #[inline]
   fn inner(&self) -> &Inner {
      // SAFETY: the handle holds a reference, keeping the block alive.
      unsafe { self.inner.as_ref() }
   }

   /// Kernel id of the target, spinning out the startup window in which the
   /// new thread has not yet published it.
   fn published_tid(&self) -> libc::pid_t {
      loop {
         let tid = self.inner().tid.load(Ordering::Relaxed);
         if tid != 0 {
            return tid;
         }
         yield_now();
      }
   }
}

impl Inner {
   #[inline]
   fn retain(&self) {
      self.nref.fetch_add(1, Ordering::Relaxed);
   }

   /// Drops one reference, tearing the block down on the last one.
   ///
   /// # Safety
   ///
   /// `ptr` must carry a live reference that no one else will drop.
   unsafe fn drop_ref(ptr: *mut Inner) {
      // Acquire-release: the final decrement must observe every other
      // holder's writes before the block is torn down.
      let old = (*ptr).nref.fetch_sub(1, Ordering::AcqRel);
      debug_assert!(old > 0, "reference count underflow");
      if old != 1 {
         return;
      }
      // The initial thread's block is static and outlives all references.
      if ptr::eq(ptr, &MAIN_BLOCK) {
         return;
      }
      let handle = (*ptr).os.load(Ordering::Relaxed);
      if handle != 0 {
         // Releases the pthread identifier, the handle-close of this
         // platform. The thread is finished or finishing; detached threads
         // reap themselves.
         libc::pthread_detach(handle as libc::pthread_t);
      }
      #[cfg(test)]
      LIVE_BLOCKS.fetch_sub(1, Ordering::Relaxed);
      drop(Box::from_raw(ptr));
   }
}

impl Clone for Thread {
   fn clone(&self) -> Self {
      self.inner().retain();
      Self { inner: self.inner }
   }
}

impl Drop for Thread {
   fn drop(&mut self) {
      // SAFETY: this handle's reference is dropped exactly once, here.
      unsafe { Inner::drop_ref(self.inner.as_ptr()) };
   }
}

impl std::fmt::Debug for Thread {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let inner = self.inner();
      f.debug_struct("Thread")
         .field("os_id", &self.os_id())
         .field("tid", &inner.tid.load(Ordering::Relaxed))
         .field("finished", &self.has_finished())
         .finish()
   }
}

/// Entry shim for threads spawned by [`Thread::new_aligned`].
extern "C" fn thread_thunk(arg: *mut libc::c_void) -> *mut libc::c_void {
   // SAFETY: `arg` is the raw block pointer from new_aligned, carrying the
   // running thread's reference, which the handle below adopts.
   let raw = arg.cast::<Inner>();
   let thread = Thread {
      inner: unsafe { NonNull::new_unchecked(raw) },
   };
   let inner = thread.inner();

   // Publish our ids before anything else; the creator may still be inside
   // pthread_create, so it performs the same (idempotent) handle store.
   inner
      .os
      .store(unsafe { libc::pthread_self() } as usize, Ordering::Relaxed);
   inner.tid.store(unsafe { libc::gettid() }, Ordering::Relaxed);
   SELF.set(raw);

   // A panic ends only this thread. exit_current() arrives here as the
   // ThreadExit payload; genuine panics have already been reported by the
   // panic hook.
   let _ = panic::catch_unwind(AssertUnwindSafe(|| (inner.proc_)(&thread)));

   // Wake joiners while we still hold our reference, then drop it. The
   // release store pairs with the acquire in `wait`, publishing everything
   // the procedure wrote.
   inner.state.fetch_or(FINISHED, Ordering::Release);
   park::wake_all(&inner.state);
   drop(thread);
   ptr::null_mut()
}

/// Terminates only the calling thread. Process-wide finalizers do not run,
/// deliberately unlike whole-process exit.
///
/// On a thread spawned here, control unwinds back to the spawn shim, which
/// performs normal teardown (join wake-up, reference drop). On the attached
/// initial thread or a foreign thread there is no shim, so the thread exits
/// through the OS after equivalent teardown.
pub fn exit_current() -> ! {
   let p = SELF.get();
   if !p.is_null() && !ptr::eq(p, &MAIN_BLOCK) {
      // resume_unwind skips the panic hook; this is control flow, not an error.
      panic::resume_unwind(Box::new(ThreadExit));
   }
   if !p.is_null() {
      SELF.set(ptr::null());
      // SAFETY: `p` is the attached block, still holding the thread's own
      // reference, which we retire on its behalf.
      unsafe {
         (*p).state.fetch_or(FINISHED, Ordering::Release);
         park::wake_all(&(*p).state);
         Inner::drop_ref(p.cast_mut());
      }
   }
   // SAFETY: ends the calling thread; no Rust frames with destructors
   // remain between here and the thread boundary that we care about.
   unsafe { libc::pthread_exit(ptr::null_mut()) }
}

/// Cooperative yield to the OS scheduler. No blocking guarantee.
pub fn yield_now() {
   // SAFETY: trivially safe libc call.
   unsafe { libc::sched_yield() };
}

/// Reads the scheduling priority of `target`, or of the calling thread when
/// `target` is `None`.
pub fn priority(target: Option<&Thread>) -> Result<Priority, Error> {
   let tid = match target {
      Some(t) => t.published_tid(),
      None => 0,
   };
   // getpriority legitimately returns -1; errno disambiguates.
   // SAFETY: straightforward libc calls on a valid (or zero = self) id.
   unsafe {
      *libc::__errno_location() = 0;
      let nice = libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t);
      if nice == -1 && *libc::__errno_location() != 0 {
         return Err(Error::Os(io::Error::last_os_error()));
      }
      Ok(Priority::from_nice(nice))
   }
}

/// Sets the scheduling priority of `target`, or of the calling thread when
/// `target` is `None`. Raising priority beyond the default typically
/// requires elevated privileges; the OS error is surfaced as-is.
pub fn set_priority(target: Option<&Thread>, priority: Priority) -> Result<(), Error> {
   let tid = match target {
      Some(t) => t.published_tid(),
      None => 0,
   };
   // SAFETY: straightforward libc call on a valid (or zero = self) id.
   let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, priority.to_nice()) };
   if rc != 0 {
      return Err(Error::Os(io::Error::last_os_error()));
   }
   Ok(())
}

/// Sleeps until the timeout elapses or a console interrupt arrives.
///
/// The interrupt handler is registered for the duration of the call and
/// deregistered on every exit path.
pub fn sleep(timeout: impl Into<Timeout>) -> Result<Sleep, Error> {
   interrupt::sleep(timeout.into())
}

/// Sleeps for the full timeout, immune to the interrupt mechanism. Signals
/// restart the delay with the recomputed remaining time.
pub fn sleep_noninterruptible(timeout: impl Into<Timeout>) {
   let deadline = Deadline::start(timeout.into());
   loop {
      let chunk = match deadline.remaining() {
         // Unbounded: sleep in long slices, forever.
         None => Duration::from_secs(3600),
         Some(Duration::ZERO) => return,
         Some(rem) => rem,
      };
      let ts = libc::timespec {
         tv_sec: chunk.as_secs().min(3600) as libc::time_t,
         tv_nsec: chunk.subsec_nanos() as libc::c_long,
      };
      // SAFETY: valid timespec; interrupted sleeps loop with fresh remaining time.
      unsafe { libc::nanosleep(&ts, ptr::null_mut()) };
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::atomic::{AtomicUsize, Ordering};
   use std::sync::{Mutex, MutexGuard};
   use std::time::Instant;

   /// The live-block counter is process-global, so the tests that assert on
   /// it cannot overlap.
   fn serial() -> MutexGuard<'static, ()> {
      static LOCK: Mutex<()> = Mutex::new(());
      LOCK.lock().unwrap_or_else(|e| e.into_inner())
   }

   fn live_blocks() -> usize {
      LIVE_BLOCKS.load(Ordering::Relaxed)
   }

   /// Polls until every dynamically allocated block has been torn down.
   fn wait_for_teardown(baseline: usize) {
      let start = Instant::now();
      while live_blocks() != baseline {
         assert!(
            start.elapsed() < Duration::from_secs(10),
            "control blocks were not freed"
         );
         yield_now();
      }
   }

   fn short_proc(t: &Thread) {
      // Echo a marker back through the payload.
      let p = t.data_ptr();
      if t.data_len() >= 2 {
         // SAFETY: payload is live and only this thread writes it.
         unsafe { *p.add(1) = (*p).wrapping_add(1) };
      }
   }

   #[test]
   fn refcount_frees_block_exactly_once() {
      let _guard = serial();
      let baseline = live_blocks();
      let t = Thread::new(short_proc, &[7, 0]).expect("spawn");
      assert_eq!(live_blocks(), baseline + 1);
      assert_eq!(t.wait(Timeout::Forever), JoinWait::Finished);
      assert_eq!(t.data()[1], 8);
      // Creator's reference is one of two; the thread has dropped (or is
      // about to drop) its own on the way out.
      drop(t);
      wait_for_teardown(baseline);
   }

   #[test]
   fn join_timeout_then_success_frees_block() {
      let _guard = serial();
      fn sleepy(_: &Thread) {
         sleep_noninterruptible(Duration::from_millis(200));
      }
      let baseline = live_blocks();
      let t = Thread::new(sleepy, &[]).expect("spawn");
      assert_eq!(t.wait(Duration::from_millis(50)), JoinWait::TimedOut);
      assert_eq!(t.wait(Timeout::Forever), JoinWait::Finished);
      drop(t);
      wait_for_teardown(baseline);
   }

   #[test]
   fn clone_extends_block_lifetime() {
      let _guard = serial();
      let baseline = live_blocks();
      let t = Thread::new(short_proc, &[1, 0]).expect("spawn");
      let extra = t.clone();
      assert_eq!(extra.wait(Timeout::Forever), JoinWait::Finished);
      drop(t);
      // The clone still pins the block.
      assert!(extra.has_finished());
      drop(extra);
      wait_for_teardown(baseline);
   }

   #[test]
   fn main_block_survives_zero_count() {
      let _guard = serial();
      let baseline = live_blocks();
      let first = Thread::attach_main();
      let second = Thread::attach_main();
      assert_eq!(first.os_id(), second.os_id());
      drop(first);
      drop(second);

      // Retire the running thread's own reference too, driving the count
      // to zero: the static block must shrug it off, and later handles
      // must keep working.
      // SAFETY: retiring the attach-time self reference exactly once.
      unsafe { Inner::drop_ref((&MAIN_BLOCK as *const Inner).cast_mut()) };
      assert_eq!(MAIN_BLOCK.nref.load(Ordering::Relaxed), 0);

      let again = Thread::attach_main();
      assert!(!again.has_finished());
      drop(again);
      // Put the self reference back for anything that runs after us.
      MAIN_BLOCK.retain();
      assert_eq!(live_blocks(), baseline);
   }

   #[test]
   fn current_matches_own_block() {
      let _guard = serial();
      static SEEN: AtomicUsize = AtomicUsize::new(0);
      fn observer(t: &Thread) {
         let me = Thread::current().expect("attached thread");
         if me.os_id() == t.os_id() {
            SEEN.fetch_add(1, Ordering::SeqCst);
         }
      }
      let baseline = live_blocks();
      let t = Thread::new(observer, &[]).expect("spawn");
      assert_eq!(t.wait(Timeout::Forever), JoinWait::Finished);
      assert_eq!(SEEN.load(Ordering::SeqCst), 1);
      drop(t);
      wait_for_teardown(baseline);
   }
}
