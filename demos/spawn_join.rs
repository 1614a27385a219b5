//! Spawns a control-block thread that chews on its payload for a while,
//! polls it with a short join timeout, then joins for real.

use std::time::Duration;

use threadbare::thread::sleep_noninterruptible;
use threadbare::{JoinWait, Thread, Timeout};

fn crunch(t: &Thread) {
   sleep_noninterruptible(Duration::from_millis(200));
   let sum: u8 = t.data().iter().copied().sum();
   // SAFETY: the running thread is the payload's only writer.
   unsafe { *t.data_ptr() = sum };
}

fn main() {
   let t = Thread::new(crunch, &[1, 2, 3, 4]).expect("spawn");
   println!("spawned {t:?}");

   match t.wait(Duration::from_millis(50)) {
      JoinWait::TimedOut => println!("still running after 50ms, as expected"),
      JoinWait::Finished => println!("finished surprisingly fast"),
   }

   assert_eq!(t.wait(Timeout::Forever), JoinWait::Finished);
   println!("payload checksum: {}", t.data()[0]);
}
