//! Timers and task spawning for the debounce loop.
//!
//! The controller never touches `setTimeout` directly. In the browser the
//! `BrowserScheduler` drives it; tests drive a virtual clock instead.

use futures_util::future::LocalBoxFuture;
use std::time::Duration;

/// Single-threaded timer and spawn facility.
pub trait Scheduler {
    /// A future that resolves once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()>;

    /// Runs a task to completion in the background.
    fn spawn(&self, task: LocalBoxFuture<'static, ()>);
}

/// Event-loop scheduler backed by `setTimeout` and `spawn_local`.
#[cfg(target_arch = "wasm32")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserScheduler;

#[cfg(target_arch = "wasm32")]
impl Scheduler for BrowserScheduler {
    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        use futures_util::FutureExt;
        let ms = u32::try_from(duration.as_millis()).unwrap_or(u32::MAX);
        sleep_ms(ms).boxed_local()
    }

    fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        wasm_bindgen_futures::spawn_local(task);
    }
}

#[cfg(target_arch = "wasm32")]
async fn sleep_ms(ms: u32) {
    use wasm_bindgen::prelude::*;

    #[wasm_bindgen]
    extern "C" {
        #[wasm_bindgen(js_name = setTimeout)]
        fn set_timeout(callback: &JsValue, millis: u32) -> i32;
    }

    // The callback owns itself until it fires, so an aborted sleep never
    // leaves JS holding a dropped closure.
    let (tx, rx) = futures_channel::oneshot::channel::<()>();
    let callback = Closure::once_into_js(move || {
        let _ = tx.send(());
    });
    set_timeout(&callback, ms);
    let _ = rx.await;
}

#[cfg(test)]
pub(crate) mod manual {
    use super::Scheduler;
    use futures_channel::oneshot;
    use futures_executor::LocalSpawner;
    use futures_util::future::LocalBoxFuture;
    use futures_util::task::LocalSpawnExt;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct Clock {
        now: Duration,
        timers: Vec<(Duration, oneshot::Sender<()>)>,
    }

    /// Virtual-clock scheduler: time only moves on `advance`.
    #[derive(Clone)]
    pub(crate) struct ManualScheduler {
        spawner: LocalSpawner,
        clock: Rc<RefCell<Clock>>,
    }

    impl ManualScheduler {
        pub(crate) fn new(spawner: LocalSpawner) -> Self {
            Self {
                spawner,
                clock: Rc::new(RefCell::new(Clock::default())),
            }
        }

        /// Moves the clock forward and fires every timer that came due.
        pub(crate) fn advance(&self, by: Duration) {
            let due = {
                let mut clock = self.clock.borrow_mut();
                clock.now += by;
                let now = clock.now;
                let (due, waiting): (Vec<_>, Vec<_>) =
                    clock.timers.drain(..).partition(|(deadline, _)| *deadline <= now);
                clock.timers = waiting;
                due
            };
            for (_, tx) in due {
                let _ = tx.send(());
            }
        }

        /// Timers still waited on by a live task.
        pub(crate) fn pending_timers(&self) -> usize {
            self.clock
                .borrow()
                .timers
                .iter()
                .filter(|(_, tx)| !tx.is_canceled())
                .count()
        }
    }

    impl Scheduler for ManualScheduler {
        fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
            let (tx, rx) = oneshot::channel();
            let mut clock = self.clock.borrow_mut();
            let deadline = clock.now + duration;
            clock.timers.push((deadline, tx));
            Box::pin(async move {
                let _ = rx.await;
            })
        }

        fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
            if let Err(e) = self.spawner.spawn_local(task) {
                log::warn!("Failed to spawn task: {}", e);
            }
        }
    }
}
