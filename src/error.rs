//! Error taxonomy for fallible operations.
//!
//! Timeouts are deliberately absent: a timed-out wait is a first-class
//! outcome of the wait's own result type, never an error.

use std::io;

/// Errors reported by thread-control operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// A required argument was malformed: an unsupported payload alignment
   /// or size, or a target in a state the operation cannot act on.
   #[error("invalid argument: {0}")]
   InvalidArgument(&'static str),

   /// The control block could not be allocated. Reported synchronously;
   /// nothing reachable is left behind.
   #[error("out of memory")]
   OutOfMemory,

   /// The kernel rejected an operation; the raw OS error is preserved.
   #[error("os error: {0}")]
   Os(#[from] io::Error),
}
