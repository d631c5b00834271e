//! Scheduling primitives: bounded keyed worker pools and wakeable loops.

mod keyed;
mod wakeup;

pub use keyed::{ExecutorError, KeyedExecutor, TaskHandle};
pub use wakeup::{LoopRunner, WakeReceiver, Wakeup, spawn_loop, wakeup_channel};
