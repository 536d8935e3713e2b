//! # ConnectionManager
//! Owns the one live connection of a channel.
//!
//! `connect` opens the link and hands it to a background pump, which decodes inbound frames into
//! events for the channel's [`EventRouter`], writes outbound frames, and reconnects with backoff
//! when the link drops. Every connect starts a new epoch; anything a pump from an older epoch tries
//! to do is ignored, so after `disconnect` returns the torn-down connection can't touch the state.

use std::{cell::RefCell, rc::Rc};

use futures::{
    FutureExt, StreamExt,
    channel::{mpsc, oneshot},
    select_biased,
    task::{LocalSpawn, LocalSpawnExt},
};
use slotmap::{SlotMap, new_key_type};

use crate::{
    ChannelEvent, ChannelId, RetryPolicy,
    router::EventRouter,
    runtime::Timer,
    transport::{Link, Transport, TransportError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    AuthRejected,
    RetriesExhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: FailureReason },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("channel {0} is not connected")]
    NotConnected(ChannelId),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

new_key_type! {
    pub struct StateListenerKey;
}

type StateListener = Rc<dyn Fn(ConnectionState)>;

struct Live {
    token: String,
    // Dropping the sender is what tells the pump to stop.
    _shutdown: oneshot::Sender<()>,
    outbound: mpsc::UnboundedSender<String>,
}

struct Inner {
    state: ConnectionState,
    epoch: u64,
    live: Option<Live>,
    listeners: SlotMap<StateListenerKey, StateListener>,
}

pub struct ConnectionManager<E: ChannelEvent> {
    channel: ChannelId,
    url: String,
    transport: Rc<dyn Transport>,
    timer: Rc<dyn Timer>,
    spawner: Rc<dyn LocalSpawn>,
    policy: RetryPolicy,
    router: Rc<EventRouter<E>>,
    inner: RefCell<Inner>,
}

impl<E: ChannelEvent> ConnectionManager<E> {
    pub fn new(
        channel: ChannelId,
        url: impl Into<String>,
        transport: Rc<dyn Transport>,
        timer: Rc<dyn Timer>,
        spawner: Rc<dyn LocalSpawn>,
        policy: RetryPolicy,
    ) -> Rc<Self> {
        Rc::new(Self {
            channel,
            url: url.into(),
            transport,
            timer,
            spawner,
            policy,
            router: Rc::new(EventRouter::new(channel)),
            inner: RefCell::new(Inner {
                state: ConnectionState::Disconnected,
                epoch: 0,
                live: None,
                listeners: SlotMap::with_key(),
            }),
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    pub fn router(&self) -> &Rc<EventRouter<E>> {
        &self.router
    }

    /// Called with every state transition, in order.
    pub fn on_state_change(
        &self,
        listener: impl Fn(ConnectionState) + 'static,
    ) -> StateListenerKey {
        self.inner.borrow_mut().listeners.insert(Rc::new(listener))
    }

    pub fn remove_state_listener(&self, key: StateListenerKey) -> bool {
        self.inner.borrow_mut().listeners.remove(key).is_some()
    }

    /// Opens the channel with `token`, replacing any connection made with a different token.
    ///
    /// Resolves once the first attempt settles. A rejected token ends in
    /// `Failed { AuthRejected }`; a network failure hands over to the reconnect loop.
    pub async fn connect(self: &Rc<Self>, token: &str) -> ConnectionState {
        {
            let inner = self.inner.borrow();
            let same_token = inner.live.as_ref().is_some_and(|live| live.token == token);
            if inner.state == ConnectionState::Connected && same_token {
                return inner.state;
            }
        }

        let (epoch, mut shutdown, outbound) = self.start_session(token);
        log::info!("Connecting to {} at {}", self.channel, self.url);

        let opened = {
            let open = self.transport.open(&self.url, token).fuse();
            futures::pin_mut!(open);
            select_biased! {
                _ = &mut shutdown => None,
                result = open => Some(result),
            }
        };

        let link = match opened {
            // Torn down while the attempt was in flight.
            None => return self.state(),
            Some(Ok(link)) => {
                if !self.transition(epoch, ConnectionState::Connected) {
                    return self.state();
                }
                Some(link)
            }
            Some(Err(TransportError::Unauthorized)) => {
                log::warn!("{} rejected the session token", self.channel);
                self.fail(epoch, FailureReason::AuthRejected);
                return self.state();
            }
            Some(Err(e)) => {
                log::warn!("Couldn't open {}: {e}", self.channel);
                None
            }
        };

        let pump = Pump {
            manager: self.clone(),
            epoch,
            token: token.to_string(),
            shutdown,
            outbound,
        };
        if let Err(e) = self.spawner.spawn_local(pump.run(link)) {
            log::error!("Failed to spawn the {} pump: {e}", self.channel);
            self.teardown();
            self.set_state(ConnectionState::Disconnected);
        }
        self.state()
    }

    /// Closes the connection and drops every subscription on this channel.
    pub fn disconnect(&self) {
        self.teardown();
        self.router.clear();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Queues an outbound event on the live link.
    pub fn send(&self, event: &E) -> Result<(), ConnectionError> {
        let frame = event.encode()?;
        let inner = self.inner.borrow();
        match (&inner.state, &inner.live) {
            (ConnectionState::Connected, Some(live)) => live
                .outbound
                .unbounded_send(frame)
                .map_err(|_| ConnectionError::NotConnected(self.channel)),
            _ => Err(ConnectionError::NotConnected(self.channel)),
        }
    }

    fn start_session(
        &self,
        token: &str,
    ) -> (u64, oneshot::Receiver<()>, mpsc::UnboundedReceiver<String>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded();
        let (epoch, previous) = {
            let mut inner = self.inner.borrow_mut();
            inner.epoch += 1;
            let previous = inner.live.replace(Live {
                token: token.to_string(),
                _shutdown: shutdown_tx,
                outbound: outbound_tx,
            });
            (inner.epoch, previous)
        };
        drop(previous);
        self.set_state(ConnectionState::Connecting);
        (epoch, shutdown_rx, outbound_rx)
    }

    fn teardown(&self) {
        let previous = {
            let mut inner = self.inner.borrow_mut();
            inner.epoch += 1;
            inner.live.take()
        };
        drop(previous);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.inner.borrow().epoch == epoch
    }

    /// Applies `state` if `epoch` is still the live session. Returns false if it isn't.
    fn transition(&self, epoch: u64, state: ConnectionState) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.set_state(state);
        true
    }

    fn fail(&self, epoch: u64, reason: FailureReason) {
        let previous = {
            let mut inner = self.inner.borrow_mut();
            if inner.epoch != epoch {
                return;
            }
            inner.live.take()
        };
        drop(previous);
        self.set_state(ConnectionState::Failed { reason });
    }

    fn deliver(&self, epoch: u64, frame: &str) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        match E::decode(frame) {
            Ok(event) => {
                self.router.dispatch(&event);
            }
            Err(e) => log::warn!("Dropping malformed frame on {}: {e}", self.channel),
        }
        true
    }

    fn set_state(&self, state: ConnectionState) {
        let listeners: Vec<StateListener> = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == state {
                return;
            }
            log::info!("{}: {:?} -> {state:?}", self.channel, inner.state);
            inner.state = state;
            inner.listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(state);
        }
    }
}

enum Drive {
    Shutdown,
    Dropped(String),
    Rejected,
}

enum Step {
    Shutdown,
    Outbound(Option<String>),
    Inbound(Option<Result<String, TransportError>>),
}

/// Background task owning the link of one epoch.
struct Pump<E: ChannelEvent> {
    manager: Rc<ConnectionManager<E>>,
    epoch: u64,
    token: String,
    shutdown: oneshot::Receiver<()>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl<E: ChannelEvent> Pump<E> {
    async fn run(mut self, mut link: Option<Box<dyn Link>>) {
        loop {
            let mut current = match link.take() {
                Some(link) => link,
                None => match self.reconnect().await {
                    Some(link) => link,
                    None => return,
                },
            };

            let outcome = self.drive(current.as_mut()).await;
            current.close();
            match outcome {
                Drive::Shutdown => return,
                Drive::Rejected => {
                    log::warn!("{} revoked the session token", self.manager.channel);
                    self.manager.fail(self.epoch, FailureReason::AuthRejected);
                    return;
                }
                Drive::Dropped(reason) => {
                    log::warn!("Lost {}: {reason}", self.manager.channel);
                }
            }
        }
    }

    async fn drive(&mut self, link: &mut dyn Link) -> Drive {
        loop {
            let step = {
                let recv = link.recv().fuse();
                futures::pin_mut!(recv);
                select_biased! {
                    _ = &mut self.shutdown => Step::Shutdown,
                    frame = self.outbound.next() => Step::Outbound(frame),
                    inbound = recv => Step::Inbound(inbound),
                }
            };

            match step {
                Step::Shutdown | Step::Outbound(None) => return Drive::Shutdown,
                Step::Outbound(Some(frame)) => match link.send(frame).await {
                    Ok(()) => {}
                    Err(TransportError::Unauthorized) => return Drive::Rejected,
                    Err(e) => return Drive::Dropped(e.to_string()),
                },
                Step::Inbound(Some(Ok(frame))) => {
                    if !self.manager.deliver(self.epoch, &frame) {
                        return Drive::Shutdown;
                    }
                }
                Step::Inbound(Some(Err(TransportError::Unauthorized))) => return Drive::Rejected,
                Step::Inbound(Some(Err(e))) => return Drive::Dropped(e.to_string()),
                Step::Inbound(None) => return Drive::Dropped("closed by the server".to_string()),
            }
        }
    }

    /// Retries with backoff. Returns the new link, or `None` if this epoch is over.
    async fn reconnect(&mut self) -> Option<Box<dyn Link>> {
        let manager = self.manager.clone();
        let policy = &manager.policy;

        for attempt in 1..=policy.max_attempts {
            if !manager.transition(self.epoch, ConnectionState::Reconnecting { attempt }) {
                return None;
            }
            let delay = policy.delay_for(attempt);
            log::info!(
                "Reconnecting to {} in {delay:?} (attempt {attempt}/{})",
                manager.channel,
                policy.max_attempts
            );

            let slept = {
                let sleep = manager.timer.sleep(delay).fuse();
                futures::pin_mut!(sleep);
                select_biased! {
                    _ = &mut self.shutdown => false,
                    () = sleep => true,
                }
            };
            if !slept {
                return None;
            }

            let opened = {
                let open = manager.transport.open(&manager.url, &self.token).fuse();
                futures::pin_mut!(open);
                select_biased! {
                    _ = &mut self.shutdown => None,
                    result = open => Some(result),
                }
            };

            match opened {
                None => return None,
                Some(Ok(mut link)) => {
                    if manager.transition(self.epoch, ConnectionState::Connected) {
                        return Some(link);
                    }
                    link.close();
                    return None;
                }
                Some(Err(TransportError::Unauthorized)) => {
                    manager.fail(self.epoch, FailureReason::AuthRejected);
                    return None;
                }
                Some(Err(e)) => {
                    log::warn!("Reconnect attempt {attempt} to {} failed: {e}", manager.channel);
                }
            }
        }

        log::error!(
            "Giving up on {} after {} attempts",
            manager.channel,
            policy.max_attempts
        );
        manager.fail(self.epoch, FailureReason::RetriesExhausted);
        None
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::LocalPool;

    use super::*;
    use crate::testing::{InstantTimer, ScriptedTransport};

    #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    #[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
    enum TestEvent {
        Ping { n: u32 },
        Pong { n: u32 },
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum TestTopic {
        Ping,
        Pong,
    }

    impl ChannelEvent for TestEvent {
        type Topic = TestTopic;

        fn topic(&self) -> TestTopic {
            match self {
                TestEvent::Ping { .. } => TestTopic::Ping,
                TestEvent::Pong { .. } => TestTopic::Pong,
            }
        }
    }

    struct Harness {
        pool: LocalPool,
        transport: Rc<ScriptedTransport>,
        timer: Rc<InstantTimer>,
        manager: Rc<ConnectionManager<TestEvent>>,
        states: Rc<RefCell<Vec<ConnectionState>>>,
    }

    fn harness() -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let pool = LocalPool::new();
        let transport = ScriptedTransport::new();
        let timer = Rc::new(InstantTimer::default());
        let manager = ConnectionManager::new(
            ChannelId("test"),
            "http://localhost/events",
            transport.clone(),
            timer.clone(),
            Rc::new(pool.spawner()),
            RetryPolicy::default(),
        );
        let states = Rc::new(RefCell::new(Vec::new()));
        manager.on_state_change({
            let states = states.clone();
            move |state| states.borrow_mut().push(state)
        });
        Harness {
            pool,
            transport,
            timer,
            manager,
            states,
        }
    }

    fn collect_pings(manager: &ConnectionManager<TestEvent>) -> Rc<RefCell<Vec<u32>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        manager.router().subscribe(TestTopic::Ping, {
            let seen = seen.clone();
            move |event| {
                if let TestEvent::Ping { n } = event {
                    seen.borrow_mut().push(*n);
                }
                Ok(())
            }
        });
        seen
    }

    #[test]
    fn connects_and_delivers_events_in_order() {
        let mut h = harness();
        let seen = collect_pings(&h.manager);

        let state = h.pool.run_until(h.manager.connect("token"));
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(
            h.transport.attempts(),
            vec![("http://localhost/events".to_string(), "token".to_string())]
        );

        let remote = h.transport.remote();
        remote.push(r#"{"topic":"ping","payload":{"n":1}}"#);
        remote.push(r#"{"topic":"pong","payload":{"n":9}}"#);
        remote.push(r#"{"topic":"ping","payload":{"n":2}}"#);
        h.pool.run_until_stalled();

        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert_eq!(
            *h.states.borrow(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn malformed_frames_are_dropped_without_hurting_the_channel() {
        let mut h = harness();
        let seen = collect_pings(&h.manager);
        h.pool.run_until(h.manager.connect("token"));

        let remote = h.transport.remote();
        remote.push("not json");
        remote.push(r#"{"topic":"unknown","payload":{}}"#);
        remote.push(r#"{"topic":"ping","payload":{"n":3}}"#);
        h.pool.run_until_stalled();

        assert_eq!(*seen.borrow(), vec![3]);
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn connect_with_the_same_token_is_idempotent() {
        let mut h = harness();
        h.pool.run_until(h.manager.connect("token"));
        h.pool.run_until(h.manager.connect("token"));
        assert_eq!(h.transport.links_opened(), 1);

        let first = h.transport.remote();
        h.pool.run_until(h.manager.connect("rotated"));
        h.pool.run_until_stalled();
        assert_eq!(h.transport.links_opened(), 2);
        assert!(first.is_closed());
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn rejected_token_fails_without_retrying() {
        let mut h = harness();
        h.transport.reject_next();

        let state = h.pool.run_until(h.manager.connect("expired"));
        h.pool.run_until_stalled();

        assert_eq!(
            state,
            ConnectionState::Failed {
                reason: FailureReason::AuthRejected
            }
        );
        assert_eq!(h.transport.attempts().len(), 1);
        assert!(h.timer.slept().is_empty());
    }

    #[test]
    fn token_revoked_mid_session_fails_without_retrying() {
        let mut h = harness();
        h.pool.run_until(h.manager.connect("token"));
        h.transport.remote().close_with(TransportError::Unauthorized);
        h.pool.run_until_stalled();

        assert_eq!(
            h.manager.state(),
            ConnectionState::Failed {
                reason: FailureReason::AuthRejected
            }
        );
        assert_eq!(h.transport.attempts().len(), 1);
    }

    #[test]
    fn reconnects_after_a_drop_and_keeps_delivering() {
        let mut h = harness();
        let seen = collect_pings(&h.manager);
        h.pool.run_until(h.manager.connect("token"));

        h.transport.remote().drop_connection();
        h.pool.run_until_stalled();

        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.transport.links_opened(), 2);
        assert_eq!(
            *h.states.borrow(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting { attempt: 1 },
                ConnectionState::Connected,
            ]
        );

        h.transport
            .remote()
            .push(r#"{"topic":"ping","payload":{"n":7}}"#);
        h.pool.run_until_stalled();
        assert_eq!(*seen.borrow(), vec![7]);
    }

    #[test]
    fn ten_failures_then_success_converges() {
        let mut h = harness();
        let seen = collect_pings(&h.manager);
        h.transport
            .fail_next(10, TransportError::Network("offline".to_string()));

        h.pool.run_until(h.manager.connect("token"));
        h.pool.run_until_stalled();

        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.transport.attempts().len(), 11);

        h.transport
            .remote()
            .push(r#"{"topic":"ping","payload":{"n":1}}"#);
        h.pool.run_until_stalled();
        assert_eq!(*seen.borrow(), vec![1]);
    }

    #[test]
    fn eleven_failures_give_up_with_capped_backoff() {
        let mut h = harness();
        h.transport
            .fail_next(11, TransportError::Network("offline".to_string()));

        h.pool.run_until(h.manager.connect("token"));
        h.pool.run_until_stalled();

        assert_eq!(
            h.manager.state(),
            ConnectionState::Failed {
                reason: FailureReason::RetriesExhausted
            }
        );
        assert_eq!(h.transport.attempts().len(), 11);
        let delays: Vec<u64> = h
            .timer
            .slept()
            .iter()
            .map(|delay| delay.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10, 10, 10, 10, 10]);
        assert_eq!(
            h.states.borrow().last(),
            Some(&ConnectionState::Failed {
                reason: FailureReason::RetriesExhausted
            })
        );

        // Nothing retries on its own afterwards.
        h.pool.run_until_stalled();
        assert_eq!(h.transport.attempts().len(), 11);
    }

    #[test]
    fn disconnect_is_terminal_and_clears_subscriptions() {
        let mut h = harness();
        collect_pings(&h.manager);
        h.pool.run_until(h.manager.connect("token"));
        let remote = h.transport.remote();

        h.manager.disconnect();
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.manager.router().subscriber_count(TestTopic::Ping), 0);

        remote.push(r#"{"topic":"ping","payload":{"n":1}}"#);
        remote.drop_connection();
        h.pool.run_until_stalled();

        assert!(remote.is_closed());
        assert_eq!(h.states.borrow().last(), Some(&ConnectionState::Disconnected));
        assert_eq!(h.transport.attempts().len(), 1);
    }

    #[test]
    fn disconnect_stops_a_pending_reconnect() {
        let mut h = harness();
        h.pool.run_until(h.manager.connect("token"));

        h.transport.remote().drop_connection();
        h.manager.disconnect();
        h.pool.run_until_stalled();

        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(h.transport.attempts().len(), 1);
        assert!(h.timer.slept().is_empty());
    }

    #[test]
    fn send_writes_frames_only_while_connected() {
        let mut h = harness();
        assert!(matches!(
            h.manager.send(&TestEvent::Pong { n: 1 }),
            Err(ConnectionError::NotConnected(_))
        ));

        h.pool.run_until(h.manager.connect("token"));
        h.manager.send(&TestEvent::Pong { n: 2 }).unwrap();
        h.pool.run_until_stalled();

        assert_eq!(
            h.transport.remote().sent(),
            vec![r#"{"topic":"pong","payload":{"n":2}}"#.to_string()]
        );
    }

    #[test]
    fn removed_state_listeners_stop_hearing_transitions() {
        let mut h = harness();
        let calls = Rc::new(RefCell::new(0));
        let key = h.manager.on_state_change({
            let calls = calls.clone();
            move |_| *calls.borrow_mut() += 1
        });
        assert!(h.manager.remove_state_listener(key));
        assert!(!h.manager.remove_state_listener(key));

        h.pool.run_until(h.manager.connect("token"));
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn state_serializes_with_a_tag() {
        let json = serde_json::to_value(ConnectionState::Reconnecting { attempt: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "reconnecting", "attempt": 2}));

        let json = serde_json::to_value(ConnectionState::Failed {
            reason: FailureReason::AuthRejected,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"state": "failed", "reason": "authRejected"})
        );
    }
}
