//! Process-termination tiers.
//!
//! Three escalation levels mirror the C runtime split between `_Exit`,
//! `quick_exit` and `exit`: terminate immediately, terminate after the
//! quick-exit callbacks, or terminate after full process finalization. The
//! callback queues themselves belong to the runtime embedding this crate;
//! each tier exposes a single registration slot for its hook.

use crate::once::Once;

static QUICK_EXIT_HOOK: Once<fn()> = Once::new();
static FINALIZE_HOOK: Once<fn()> = Once::new();

/// Registers the callback run by [`quick_exit`]. Only the first
/// registration takes effect; returns whether this call installed it.
pub fn set_quick_exit_hook(hook: fn()) -> bool {
   QUICK_EXIT_HOOK.try_set(hook).is_ok()
}

/// Registers the process-finalization callback run by [`exit`]. Only the
/// first registration takes effect; returns whether this call installed it.
pub fn set_finalize_hook(hook: fn()) -> bool {
   FINALIZE_HOOK.try_set(hook).is_ok()
}

/// Terminates the process immediately. No callbacks of any kind run.
pub fn exit_immediate(code: i32) -> ! {
   // SAFETY: trivially safe libc call; never returns.
   unsafe { libc::_exit(code) }
}

/// Runs the quick-exit hook, then terminates.
pub fn quick_exit(code: i32) -> ! {
   if let Some(hook) = QUICK_EXIT_HOOK.get() {
      hook();
   }
   exit_immediate(code)
}

/// Runs process-wide finalization, then terminates.
pub fn exit(code: i32) -> ! {
   if let Some(hook) = FINALIZE_HOOK.get() {
      hook();
   }
   exit_immediate(code)
}
