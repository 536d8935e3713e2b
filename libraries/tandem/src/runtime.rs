//! The pieces of the event loop the sync layer needs: wall-clock time, timers and a way to spawn tasks.
//! They're traits so tests can run everything on a `futures::executor::LocalPool` with a fake clock.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use futures::{FutureExt, future::LocalBoxFuture};

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub trait Timer {
    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()>;
}

/// Races `future` against a timer. Returns `None` if the timer won.
pub async fn with_timeout<F: Future>(
    timer: &dyn Timer,
    duration: Duration,
    future: F,
) -> Option<F::Output> {
    let future = future.fuse();
    let expired = timer.sleep(duration).fuse();
    futures::pin_mut!(future, expired);

    futures::select_biased! {
        output = future => Some(output),
        () = expired => None,
    }
}

/// Wraps a sleep so `cancel` runs if it is dropped before it finishes.
pub fn cancel_on_drop(
    sleep: impl Future<Output = ()> + 'static,
    cancel: impl FnOnce() + 'static,
) -> LocalBoxFuture<'static, ()> {
    struct Guard<C: FnOnce()>(Option<C>);

    impl<C: FnOnce()> Drop for Guard<C> {
        fn drop(&mut self) {
            if let Some(cancel) = self.0.take() {
                cancel();
            }
        }
    }

    let mut guard = Guard(Some(cancel));
    async move {
        sleep.await;
        // fired, nothing left to cancel
        guard.0 = None;
    }
    .boxed_local()
}

#[cfg(all(target_arch = "wasm32", feature = "web"))]
pub use browser::{BrowserSpawner, BrowserTimer};

#[cfg(all(target_arch = "wasm32", feature = "web"))]
mod browser {
    use std::time::Duration;

    use futures::{
        FutureExt,
        future::LocalBoxFuture,
        task::{LocalFutureObj, LocalSpawn, SpawnError},
    };

    /// `setTimeout`-backed timer.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct BrowserTimer;

    impl super::Timer for BrowserTimer {
        fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
            let millis = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
            let mut handle = None;
            let promise = js_sys::Promise::new(&mut |resolve, _reject| {
                let Some(window) = web_sys::window() else {
                    log::error!("No window available, timer will never fire");
                    return;
                };
                match window.set_timeout_with_callback_and_timeout_and_arguments_0(&resolve, millis)
                {
                    Ok(id) => handle = Some(id),
                    Err(e) => log::error!("setTimeout failed: {e:?}"),
                }
            });
            let fired = async move {
                let _ = wasm_bindgen_futures::JsFuture::from(promise).await;
            };
            match handle {
                Some(handle) => super::cancel_on_drop(fired, move || {
                    if let Some(window) = web_sys::window() {
                        window.clear_timeout_with_handle(handle);
                    }
                }),
                None => fired.boxed_local(),
            }
        }
    }

    /// Spawns onto the browser's microtask queue.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct BrowserSpawner;

    impl LocalSpawn for BrowserSpawner {
        fn spawn_local_obj(&self, future: LocalFutureObj<'static, ()>) -> Result<(), SpawnError> {
            wasm_bindgen_futures::spawn_local(future);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::testing::{InstantTimer, ManualTimer};
    use futures::{
        channel::oneshot,
        executor::{LocalPool, block_on},
        task::LocalSpawnExt,
    };

    #[test]
    fn ready_future_beats_the_timer() {
        let timer = InstantTimer::default();
        let output = block_on(with_timeout(&timer, Duration::from_secs(3), async { 7 }));
        assert_eq!(output, Some(7));
    }

    #[test]
    fn pending_future_times_out() {
        let timer = InstantTimer::default();
        let output = block_on(with_timeout(
            &timer,
            Duration::from_secs(3),
            futures::future::pending::<()>(),
        ));
        assert_eq!(output, None);
        assert_eq!(timer.slept(), vec![Duration::from_secs(3)]);
    }

    #[test]
    fn timeout_waits_for_the_deadline() {
        let mut pool = LocalPool::new();
        let timer = Rc::new(ManualTimer::default());
        let (_reply, response) = oneshot::channel::<u32>();
        let output = Rc::new(RefCell::new(None));
        pool.spawner()
            .spawn_local({
                let timer = timer.clone();
                let output = output.clone();
                async move {
                    let result = with_timeout(&*timer, Duration::from_secs(3), response).await;
                    *output.borrow_mut() = Some(result.map(|r| r.ok()));
                }
            })
            .unwrap();

        pool.run_until_stalled();
        timer.advance(Duration::from_millis(2999));
        pool.run_until_stalled();
        assert!(output.borrow().is_none());

        timer.advance(Duration::from_millis(1));
        pool.run_until_stalled();
        assert_eq!(*output.borrow(), Some(None));
        assert_eq!(timer.pending_sleeps(), 0);
    }

    #[test]
    fn answered_request_cancels_its_timeout() {
        let mut pool = LocalPool::new();
        let timer = Rc::new(ManualTimer::default());
        let (reply, response) = oneshot::channel::<u32>();
        let output = Rc::new(RefCell::new(None));
        pool.spawner()
            .spawn_local({
                let timer = timer.clone();
                let output = output.clone();
                async move {
                    let result = with_timeout(&*timer, Duration::from_secs(3), response).await;
                    *output.borrow_mut() = Some(result.map(|r| r.ok()));
                }
            })
            .unwrap();

        pool.run_until_stalled();
        assert_eq!(timer.pending_sleeps(), 1);

        reply.send(9).unwrap();
        pool.run_until_stalled();
        assert_eq!(*output.borrow(), Some(Some(Some(9))));
        assert_eq!(timer.pending_sleeps(), 0);
        assert_eq!(timer.slept(), vec![Duration::from_secs(3)]);
    }

    #[test]
    fn dropped_sleep_runs_its_cancel() {
        let cancelled = Rc::new(RefCell::new(false));
        let sleep = cancel_on_drop(futures::future::pending(), {
            let cancelled = cancelled.clone();
            move || *cancelled.borrow_mut() = true
        });
        drop(sleep);
        assert!(*cancelled.borrow());
    }

    #[test]
    fn finished_sleep_is_not_cancelled() {
        let cancelled = Rc::new(RefCell::new(false));
        block_on(cancel_on_drop(futures::future::ready(()), {
            let cancelled = cancelled.clone();
            move || *cancelled.borrow_mut() = true
        }));
        assert!(!*cancelled.borrow());
    }
}
