//! Background loop with a timed wait that can be woken early.
//!
//! The timed wait is the upper bound on reaction latency to new work; a
//! `Wakeup` handle collapses that to "now". Wake signals coalesce: waking a
//! loop that is already due runs it once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};

#[derive(Clone)]
pub struct Wakeup {
    tx: Sender<()>,
}

impl Wakeup {
    /// Request an early tick. Never blocks; a pending signal is enough.
    pub fn wakeup(&self) {
        let _ = self.tx.try_send(());
    }
}

pub struct WakeReceiver {
    rx: Receiver<()>,
    tx: Sender<()>,
}

/// Create a wakeup handle and the receiver half for [`spawn_loop`].
pub fn wakeup_channel() -> (Wakeup, WakeReceiver) {
    let (tx, rx) = bounded(1);
    (Wakeup { tx: tx.clone() }, WakeReceiver { rx, tx })
}

pub struct LoopRunner {
    wake: Wakeup,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LoopRunner {
    /// Stop the loop and wait for the thread to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.wake.wakeup();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LoopRunner {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Spawn a named loop thread running `tick` every `interval`, or sooner when
/// the paired [`Wakeup`] fires.
pub fn spawn_loop(
    name: &str,
    interval: Duration,
    receiver: WakeReceiver,
    mut tick: impl FnMut() + Send + 'static,
) -> LoopRunner {
    let stop = Arc::new(AtomicBool::new(false));
    let wake = Wakeup {
        tx: receiver.tx.clone(),
    };
    let loop_stop = Arc::clone(&stop);
    let rx = receiver.rx;
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            loop {
                if loop_stop.load(Ordering::Acquire) {
                    return;
                }
                tick();
                match rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
        .expect("spawn loop thread");
    LoopRunner {
        wake,
        stop,
        handle: Some(handle),
    }
}
