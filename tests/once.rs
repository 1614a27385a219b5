use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use threadbare::{Once, OnceFlag, OnceWait, Timeout};

#[test]
fn flag_grants_single_initializer() {
   let flag = OnceFlag::new();
   assert!(!flag.is_ready());

   // First poll claims the flag.
   assert_eq!(flag.wait(Timeout::poll()), OnceWait::Initializer);
   // While locked, a zero-timeout wait can only time out.
   assert_eq!(flag.wait(Timeout::poll()), OnceWait::TimedOut);

   flag.release();
   assert!(flag.is_ready());
   assert_eq!(flag.wait(Timeout::poll()), OnceWait::Ready);
   assert_eq!(flag.wait(Timeout::Forever), OnceWait::Ready);
}

#[test]
fn abort_reopens_the_flag() {
   let flag = OnceFlag::new();
   assert_eq!(flag.wait(Timeout::poll()), OnceWait::Initializer);
   flag.abort();
   assert!(!flag.is_ready());

   // The next caller can claim the flag again.
   assert_eq!(flag.wait(Timeout::poll()), OnceWait::Initializer);
   flag.release();
   assert!(flag.is_ready());
}

#[test]
fn reset_allows_reuse() {
   let mut flag = OnceFlag::new();
   assert_eq!(flag.wait(Timeout::poll()), OnceWait::Initializer);
   flag.release();
   assert!(flag.is_ready());

   flag.reset();
   assert!(!flag.is_ready());
   assert_eq!(flag.wait(Timeout::poll()), OnceWait::Initializer);
   flag.release();
}

#[test]
fn release_wakes_and_publishes_to_all_waiters() {
   let flag = Arc::new(OnceFlag::new());
   let value = Arc::new(AtomicUsize::new(0));

   assert_eq!(flag.wait(Timeout::Forever), OnceWait::Initializer);

   let waiters: Vec<_> = (0..8)
      .map(|_| {
         let flag = Arc::clone(&flag);
         let value = Arc::clone(&value);
         thread::spawn(move || {
            assert_eq!(flag.wait(Timeout::Forever), OnceWait::Ready);
            // The release publishes this write even though the load itself
            // is relaxed.
            value.load(Ordering::Relaxed)
         })
      })
      .collect();

   // Give the waiters a moment to park.
   thread::sleep(Duration::from_millis(50));
   value.store(42, Ordering::Relaxed);
   flag.release();

   for handle in waiters {
      assert_eq!(handle.join().unwrap(), 42);
   }
}

#[test]
fn abort_hands_off_to_exactly_one_waiter() {
   let flag = Arc::new(OnceFlag::new());
   let grants = Arc::new(AtomicUsize::new(0));

   assert_eq!(flag.wait(Timeout::Forever), OnceWait::Initializer);

   let waiters: Vec<_> = (0..4)
      .map(|_| {
         let flag = Arc::clone(&flag);
         let grants = Arc::clone(&grants);
         thread::spawn(move || match flag.wait(Timeout::Forever) {
            OnceWait::Initializer => {
               grants.fetch_add(1, Ordering::SeqCst);
               thread::sleep(Duration::from_millis(10));
               flag.release();
            }
            OnceWait::Ready => {}
            OnceWait::TimedOut => unreachable!("unbounded wait timed out"),
         })
      })
      .collect();

   thread::sleep(Duration::from_millis(50));
   flag.abort();

   for handle in waiters {
      handle.join().unwrap();
   }
   // Exactly one waiter inherited the initializer role.
   assert_eq!(grants.load(Ordering::SeqCst), 1);
   assert!(flag.is_ready());
}

#[test]
fn timed_wait_expires_while_initialization_runs() {
   let flag = Arc::new(OnceFlag::new());
   assert_eq!(flag.wait(Timeout::Forever), OnceWait::Initializer);

   let observer = {
      let flag = Arc::clone(&flag);
      thread::spawn(move || flag.wait(Duration::from_millis(50)))
   };
   assert_eq!(observer.join().unwrap(), OnceWait::TimedOut);

   flag.release();
   assert_eq!(flag.wait(Timeout::poll()), OnceWait::Ready);
}

#[test]
fn zero_timeout_race_initializes_exactly_once() {
   // 64 threads poll a fresh flag simultaneously. Exactly one may win the
   // initializer role; everyone else observes ready or a timeout, and the
   // protected counter is bumped exactly once.
   let flag = Arc::new(OnceFlag::new());
   let inits = Arc::new(AtomicUsize::new(0));

   let threads: Vec<_> = (0..64)
      .map(|_| {
         let flag = Arc::clone(&flag);
         let inits = Arc::clone(&inits);
         thread::spawn(move || match flag.wait(Duration::ZERO) {
            OnceWait::Initializer => {
               inits.fetch_add(1, Ordering::SeqCst);
               flag.release();
               1usize
            }
            OnceWait::Ready | OnceWait::TimedOut => 0,
         })
      })
      .collect();

   let winners: usize = threads.into_iter().map(|h| h.join().unwrap()).sum();
   assert_eq!(winners, 1);
   assert_eq!(inits.load(Ordering::SeqCst), 1);
}

#[test]
fn short_timeouts_and_aborts_lose_no_wakeups() {
   // Aborts, short timeouts and releases interleave in a tight loop. The
   // test passing at all is the property: every thread comes back, nobody
   // parks forever on a wake that was spent elsewhere.
   for _ in 0..25 {
      let flag = Arc::new(OnceFlag::new());
      let attempts = Arc::new(AtomicUsize::new(0));

      let threads: Vec<_> = (0..8)
         .map(|_| {
            let flag = Arc::clone(&flag);
            let attempts = Arc::clone(&attempts);
            thread::spawn(move || loop {
               match flag.wait(Duration::from_micros(200)) {
                  OnceWait::Initializer => {
                     // The first two grants fail on purpose; the third
                     // commits.
                     if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        flag.abort();
                     } else {
                        flag.release();
                        return;
                     }
                  }
                  OnceWait::Ready => return,
                  OnceWait::TimedOut => {}
               }
            })
         })
         .collect();

      for handle in threads {
         handle.join().unwrap();
      }
      assert!(flag.is_ready());
      assert!(attempts.load(Ordering::SeqCst) >= 3);
   }
}

#[test]
fn cell_get_or_init_runs_closure_once() {
   let once: Once<i32> = Once::new();
   let counter = AtomicUsize::new(0);

   let value = once.get_or_init(|| {
      counter.fetch_add(1, Ordering::SeqCst);
      42
   });
   assert_eq!(value, &42);
   assert!(once.is_ready());
   assert_eq!(counter.load(Ordering::SeqCst), 1);

   let value = once.get_or_init(|| {
      counter.fetch_add(1, Ordering::SeqCst);
      panic!("should not be called")
   });
   assert_eq!(value, &42);
   assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn cell_multi_thread_get_or_init() {
   let once = Arc::new(Once::new());
   let init_counter = Arc::new(AtomicUsize::new(0));

   let threads: Vec<_> = (0..10)
      .map(|_| {
         let once = Arc::clone(&once);
         let counter = Arc::clone(&init_counter);
         thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            *once.get_or_init(|| {
               counter.fetch_add(1, Ordering::SeqCst);
               thread::sleep(Duration::from_millis(20));
               42
            })
         })
      })
      .collect();

   for handle in threads {
      assert_eq!(handle.join().unwrap(), 42);
   }
   assert_eq!(once.get(), Some(&42));
   assert_eq!(init_counter.load(Ordering::SeqCst), 1);
}

#[test]
fn cell_get_or_try_init_retries_after_error() {
   let once: Once<i32> = Once::new();
   let counter = AtomicUsize::new(0);

   let result = once.get_or_try_init(|| {
      counter.fetch_add(1, Ordering::SeqCst);
      Err::<i32, _>("init error")
   });
   assert_eq!(result, Err("init error"));
   assert!(!once.is_ready());
   assert_eq!(counter.load(Ordering::SeqCst), 1);

   let result = once.get_or_try_init(|| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok::<_, &str>(55)
   });
   assert_eq!(result, Ok(&55));
   assert!(once.is_ready());
   assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn cell_panic_during_init_reopens() {
   let once: Once<i32> = Once::new();

   let caught = panic::catch_unwind(AssertUnwindSafe(|| {
      once.get_or_init(|| panic!("boom"));
   }));
   assert!(caught.is_err());
   assert!(!once.is_ready());

   assert_eq!(once.get_or_init(|| 5), &5);
}

#[test]
fn cell_try_set() {
   let once: Once<i32> = Once::new();
   assert_eq!(once.try_set(42), Ok(&42));
   assert!(once.is_ready());
   // A second set fails and hands the value back.
   assert_eq!(once.try_set(24), Err(24));
   assert_eq!(once.get(), Some(&42));
}

#[test]
fn cell_try_set_fails_while_locked() {
   // Called from inside the initializing closure, try_set must fail rather
   // than deadlock: the flag is held by this very thread.
   let once: Once<i32> = Once::new();
   once.get_or_init(|| {
      assert!(matches!(once.try_set(44), Err(44)));
      42
   });
   assert_eq!(once.get(), Some(&42));
}

#[test]
fn cell_get_or_init_timeout_gives_up_on_foreign_initializer() {
   let once: Arc<Once<i32>> = Arc::new(Once::new());

   let slow = {
      let once = Arc::clone(&once);
      thread::spawn(move || {
         *once.get_or_init(|| {
            thread::sleep(Duration::from_millis(150));
            7
         })
      })
   };

   // Let the slow initializer take the flag first.
   thread::sleep(Duration::from_millis(30));
   assert_eq!(once.get_or_init_timeout(Duration::from_millis(20), || 9), None);

   // With enough patience the committed value comes through.
   assert_eq!(
      once.get_or_init_timeout(Duration::from_secs(10), || 9),
      Some(&7)
   );
   assert_eq!(slow.join().unwrap(), 7);
}

#[test]
fn cell_take_and_with_value() {
   let mut once = Once::with_value(42);
   assert!(once.is_ready());
   assert_eq!(once.take(), Some(42));
   assert!(!once.is_ready());
   assert_eq!(once.take(), None);
   assert_eq!(once.get(), None);

   assert_eq!(once.try_set(3), Ok(&3));
   assert_eq!(once.take(), Some(3));
}
