//! Eight threads race a single `OnceFlag`. Exactly one wins the initializer
//! role and releases; the rest either observe the ready state or time out
//! and retry.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use threadbare::{OnceFlag, OnceWait};

fn main() {
   let flag = Arc::new(OnceFlag::new());

   let racers: Vec<_> = (0..8)
      .map(|i| {
         let flag = Arc::clone(&flag);
         thread::spawn(move || loop {
            match flag.wait(Duration::from_millis(5)) {
               OnceWait::Initializer => {
                  println!("thread {i}: initializing");
                  thread::sleep(Duration::from_millis(20));
                  flag.release();
                  println!("thread {i}: released");
                  return;
               }
               OnceWait::Ready => {
                  println!("thread {i}: already initialized");
                  return;
               }
               OnceWait::TimedOut => println!("thread {i}: timed out, retrying"),
            }
         })
      })
      .collect();

   for handle in racers {
      handle.join().unwrap();
   }
   println!("final state: {flag:?}");
}
