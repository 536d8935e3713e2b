//! In-memory stand-ins for the clock, timers and transports, for driving the sync layer from tests.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};
use futures::{
    FutureExt, StreamExt,
    channel::{mpsc, oneshot},
    future::{self, LocalBoxFuture},
};

use crate::{
    runtime::{Clock, Timer, cancel_on_drop},
    transport::{Link, Transport, TransportError},
};

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap())
    }
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + chrono::Duration::from_std(by).unwrap());
    }

    pub fn rewind(&self, by: Duration) {
        self.now.set(self.now.get() - chrono::Duration::from_std(by).unwrap());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// A timer that fires immediately and remembers what it was asked to wait for.
#[derive(Debug, Default)]
pub struct InstantTimer {
    slept: RefCell<Vec<Duration>>,
}

impl InstantTimer {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Timer for InstantTimer {
    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        self.slept.borrow_mut().push(duration);
        future::ready(()).boxed_local()
    }
}

/// A timer whose sleeps only finish once [`ManualTimer::advance`] moves past their deadline.
/// Like [`InstantTimer`] it remembers every duration it was asked for.
#[derive(Debug, Default)]
pub struct ManualTimer {
    state: Rc<RefCell<ManualTimerState>>,
}

#[derive(Debug, Default)]
struct ManualTimerState {
    elapsed: Duration,
    next_id: u64,
    slept: Vec<Duration>,
    waiting: Vec<(u64, Duration, oneshot::Sender<()>)>,
}

impl ManualTimer {
    pub fn slept(&self) -> Vec<Duration> {
        self.state.borrow().slept.clone()
    }

    /// Sleeps that have neither fired nor been dropped.
    pub fn pending_sleeps(&self) -> usize {
        self.state.borrow().waiting.len()
    }

    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.state.borrow_mut();
            state.elapsed += by;
            let now = state.elapsed;
            let (due, waiting) = std::mem::take(&mut state.waiting)
                .into_iter()
                .partition::<Vec<_>, _>(|(_, deadline, _)| *deadline <= now);
            state.waiting = waiting;
            due
        };
        for (_, _, fire) in due {
            let _ = fire.send(());
        }
    }
}

impl Timer for ManualTimer {
    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        let mut state = self.state.borrow_mut();
        state.slept.push(duration);
        if duration.is_zero() {
            return future::ready(()).boxed_local();
        }

        let id = state.next_id;
        state.next_id += 1;
        let deadline = state.elapsed + duration;
        let (fire, fired) = oneshot::channel();
        state.waiting.push((id, deadline, fire));

        let timer = Rc::downgrade(&self.state);
        cancel_on_drop(
            async move {
                let _ = fired.await;
            },
            move || {
                if let Some(state) = timer.upgrade() {
                    state.borrow_mut().waiting.retain(|(other, ..)| *other != id);
                }
            },
        )
    }
}

/// A transport whose open attempts succeed or fail according to a script.
/// Attempts past the end of the script succeed.
#[derive(Default)]
pub struct ScriptedTransport {
    script: RefCell<VecDeque<TransportError>>,
    attempts: RefCell<Vec<(String, String)>>,
    remotes: RefCell<Vec<(String, LinkRemote)>>,
}

impl ScriptedTransport {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// The next `count` open attempts fail with `error`.
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut script = self.script.borrow_mut();
        for _ in 0..count {
            script.push_back(error.clone());
        }
    }

    pub fn reject_next(&self) {
        self.fail_next(1, TransportError::Unauthorized);
    }

    /// Every open attempt so far, as `(url, token)`.
    pub fn attempts(&self) -> Vec<(String, String)> {
        self.attempts.borrow().clone()
    }

    /// Server side of the most recently opened link.
    pub fn remote(&self) -> LinkRemote {
        self.remotes
            .borrow()
            .last()
            .map(|(_, remote)| remote.clone())
            .expect("no link has been opened")
    }

    /// Server side of the most recent link opened to `url`.
    pub fn remote_for(&self, url: &str) -> LinkRemote {
        self.remotes
            .borrow()
            .iter()
            .rev()
            .find(|(opened, _)| opened == url)
            .map(|(_, remote)| remote.clone())
            .unwrap_or_else(|| panic!("no link has been opened to {url}"))
    }

    pub fn links_opened(&self) -> usize {
        self.remotes.borrow().len()
    }
}

impl Transport for ScriptedTransport {
    fn open<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> LocalBoxFuture<'a, Result<Box<dyn Link>, TransportError>> {
        self.attempts
            .borrow_mut()
            .push((url.to_string(), token.to_string()));

        let result = match self.script.borrow_mut().pop_front() {
            Some(error) => Err(error),
            None => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded();
                let remote = LinkRemote {
                    inbound: inbound_tx,
                    sent: Rc::default(),
                    closed: Rc::default(),
                };
                let link = MemoryLink {
                    inbound: inbound_rx,
                    sent: remote.sent.clone(),
                    closed: remote.closed.clone(),
                };
                self.remotes.borrow_mut().push((url.to_string(), remote));
                Ok(Box::new(link) as Box<dyn Link>)
            }
        };
        future::ready(result).boxed_local()
    }
}

/// The server's end of a [`ScriptedTransport`] link.
#[derive(Clone)]
pub struct LinkRemote {
    inbound: mpsc::UnboundedSender<Result<String, TransportError>>,
    sent: Rc<RefCell<Vec<String>>>,
    closed: Rc<Cell<bool>>,
}

impl LinkRemote {
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.inbound.unbounded_send(Ok(frame.into()));
    }

    /// Simulates the network dropping the connection.
    pub fn drop_connection(&self) {
        let _ = self
            .inbound
            .unbounded_send(Err(TransportError::Network("connection reset".to_string())));
    }

    pub fn close_with(&self, error: TransportError) {
        let _ = self.inbound.unbounded_send(Err(error));
    }

    /// Frames the client wrote to this link.
    pub fn sent(&self) -> Vec<String> {
        self.sent.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    sent: Rc<RefCell<Vec<String>>>,
    closed: Rc<Cell<bool>>,
}

impl Link for MemoryLink {
    fn recv(&mut self) -> LocalBoxFuture<'_, Option<Result<String, TransportError>>> {
        self.inbound.next().boxed_local()
    }

    fn send(&mut self, frame: String) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        let result = if self.closed.get() {
            Err(TransportError::Closed)
        } else {
            self.sent.borrow_mut().push(frame);
            Ok(())
        };
        future::ready(result).boxed_local()
    }

    fn close(&mut self) {
        self.closed.set(true);
        self.inbound.close();
    }
}
