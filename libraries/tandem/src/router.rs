//! # EventRouter
//! Fans inbound channel events out to subscribers by topic.
//! The router knows nothing about payloads; subscribers validate what they receive.

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use slotmap::{SlotMap, new_key_type};

use crate::{ChannelEvent, ChannelId};

new_key_type! {
    pub struct SubscriptionKey;
}

/// Returned by [`EventRouter::subscribe`]. Carries the channel so a handle can't
/// remove a subscription on some other channel's router.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub channel: ChannelId,
    pub key: SubscriptionKey,
}

pub type HandlerResult = Result<(), Box<dyn std::error::Error>>;

type Handler<E> = Rc<dyn Fn(&E) -> HandlerResult>;

struct Subscriber<E: ChannelEvent> {
    topic: E::Topic,
    handler: Handler<E>,
}

struct Registry<E: ChannelEvent> {
    subscribers: SlotMap<SubscriptionKey, Subscriber<E>>,
    // Registration order per topic.
    by_topic: HashMap<E::Topic, Vec<SubscriptionKey>>,
}

pub struct EventRouter<E: ChannelEvent> {
    channel: ChannelId,
    registry: RefCell<Registry<E>>,
}

impl<E: ChannelEvent> EventRouter<E> {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            registry: RefCell::new(Registry {
                subscribers: SlotMap::with_key(),
                by_topic: HashMap::new(),
            }),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn subscribe(
        &self,
        topic: E::Topic,
        handler: impl Fn(&E) -> HandlerResult + 'static,
    ) -> SubscriptionHandle {
        let mut registry = self.registry.borrow_mut();
        let key = registry.subscribers.insert(Subscriber {
            topic,
            handler: Rc::new(handler),
        });
        registry.by_topic.entry(topic).or_default().push(key);
        SubscriptionHandle {
            channel: self.channel,
            key,
        }
    }

    /// Returns false if the handle was already removed or belongs to another channel.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        if handle.channel != self.channel {
            log::warn!(
                "Ignoring unsubscribe for channel {} on the {} router",
                handle.channel,
                self.channel
            );
            return false;
        }

        let mut registry = self.registry.borrow_mut();
        let Some(subscriber) = registry.subscribers.remove(handle.key) else {
            return false;
        };
        if let Some(keys) = registry.by_topic.get_mut(&subscriber.topic) {
            keys.retain(|key| *key != handle.key);
            if keys.is_empty() {
                registry.by_topic.remove(&subscriber.topic);
            }
        }
        true
    }

    /// Removes every subscriber of `topic` and returns how many there were.
    pub fn unsubscribe_all(&self, topic: E::Topic) -> usize {
        let mut registry = self.registry.borrow_mut();
        let keys = registry.by_topic.remove(&topic).unwrap_or_default();
        for key in &keys {
            registry.subscribers.remove(*key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut registry = self.registry.borrow_mut();
        registry.subscribers.clear();
        registry.by_topic.clear();
    }

    pub fn subscriber_count(&self, topic: E::Topic) -> usize {
        self.registry
            .borrow()
            .by_topic
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Calls every subscriber of the event's topic in registration order and returns how many ran.
    ///
    /// Handlers may subscribe or unsubscribe while this runs. One removed mid-dispatch is
    /// skipped, one added mid-dispatch first sees the next event.
    pub fn dispatch(&self, event: &E) -> usize {
        let topic = event.topic();
        let keys = match self.registry.borrow().by_topic.get(&topic) {
            Some(keys) => keys.clone(),
            None => {
                log::debug!("No subscribers on {} for {topic:?}", self.channel);
                return 0;
            }
        };

        let mut delivered = 0;
        for key in keys {
            let handler = match self.registry.borrow().subscribers.get(key) {
                Some(subscriber) => subscriber.handler.clone(),
                None => continue,
            };
            delivered += 1;
            if let Err(e) = handler(event) {
                log::error!(
                    "Subscriber on {} failed to handle {topic:?}: {e}",
                    self.channel
                );
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
    #[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
    enum TestEvent {
        Ping(u32),
        Pong(u32),
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
                TestEvent::Ping(_) => TestTopic::Ping,
                TestEvent::Pong(_) => TestTopic::Pong,
            }
        }
    }

    const TEST: ChannelId = ChannelId("test");

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&'static str) -> Box<dyn Fn(&TestEvent) -> HandlerResult>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &'static str| -> Box<dyn Fn(&TestEvent) -> HandlerResult> {
                let log = log.clone();
                Box::new(move |event| {
                    log.borrow_mut().push(format!("{name}:{event:?}"));
                    Ok(())
                })
            }
        };
        (log, make)
    }

    #[test]
    fn dispatches_to_topic_subscribers_in_registration_order() {
        let router = EventRouter::<TestEvent>::new(TEST);
        let (log, make) = recorder();
        router.subscribe(TestTopic::Ping, make("a"));
        router.subscribe(TestTopic::Pong, make("other"));
        router.subscribe(TestTopic::Ping, make("b"));

        assert_eq!(router.dispatch(&TestEvent::Ping(1)), 2);
        assert_eq!(*log.borrow(), vec!["a:Ping(1)", "b:Ping(1)"]);
    }

    #[test]
    fn failing_subscriber_does_not_block_the_rest() {
        let router = EventRouter::<TestEvent>::new(TEST);
        let (log, make) = recorder();
        router.subscribe(TestTopic::Ping, |_| Err("bad payload".into()));
        router.subscribe(TestTopic::Ping, make("after"));

        assert_eq!(router.dispatch(&TestEvent::Ping(2)), 2);
        assert_eq!(*log.borrow(), vec!["after:Ping(2)"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let router = EventRouter::<TestEvent>::new(TEST);
        let handle = router.subscribe(TestTopic::Ping, |_| Ok(()));

        assert!(router.unsubscribe(handle));
        assert!(!router.unsubscribe(handle));
        assert_eq!(router.subscriber_count(TestTopic::Ping), 0);
        assert_eq!(router.dispatch(&TestEvent::Ping(0)), 0);
    }

    #[test]
    fn handles_from_another_channel_are_ignored() {
        let router = EventRouter::<TestEvent>::new(TEST);
        let other = EventRouter::<TestEvent>::new(ChannelId("other"));
        router.subscribe(TestTopic::Ping, |_| Ok(()));
        let foreign = other.subscribe(TestTopic::Ping, |_| Ok(()));

        assert!(!router.unsubscribe(foreign));
        assert_eq!(router.subscriber_count(TestTopic::Ping), 1);
    }

    #[test]
    fn unsubscribe_all_only_touches_one_topic() {
        let router = EventRouter::<TestEvent>::new(TEST);
        router.subscribe(TestTopic::Ping, |_| Ok(()));
        router.subscribe(TestTopic::Ping, |_| Ok(()));
        router.subscribe(TestTopic::Pong, |_| Ok(()));

        assert_eq!(router.unsubscribe_all(TestTopic::Ping), 2);
        assert_eq!(router.unsubscribe_all(TestTopic::Ping), 0);
        assert_eq!(router.subscriber_count(TestTopic::Pong), 1);

        router.clear();
        assert_eq!(router.subscriber_count(TestTopic::Pong), 0);
    }

    #[test]
    fn subscriber_removed_mid_dispatch_is_not_called() {
        let router = Rc::new(EventRouter::<TestEvent>::new(TEST));
        let second_called = Rc::new(Cell::new(false));
        let victim: Rc<Cell<Option<SubscriptionHandle>>> = Rc::default();

        router.subscribe(TestTopic::Ping, {
            let router = router.clone();
            let victim = victim.clone();
            move |_| {
                if let Some(handle) = victim.get() {
                    router.unsubscribe(handle);
                }
                Ok(())
            }
        });
        let handle = router.subscribe(TestTopic::Ping, {
            let second_called = second_called.clone();
            move |_| {
                second_called.set(true);
                Ok(())
            }
        });
        victim.set(Some(handle));

        assert_eq!(router.dispatch(&TestEvent::Ping(3)), 1);
        assert!(!second_called.get());
    }

    #[test]
    fn subscriber_may_remove_itself() {
        let router = Rc::new(EventRouter::<TestEvent>::new(TEST));
        let calls = Rc::new(Cell::new(0));
        let own: Rc<Cell<Option<SubscriptionHandle>>> = Rc::default();

        let handle = router.subscribe(TestTopic::Ping, {
            let router = router.clone();
            let own = own.clone();
            let calls = calls.clone();
            move |_| {
                calls.set(calls.get() + 1);
                if let Some(handle) = own.get() {
                    router.unsubscribe(handle);
                }
                Ok(())
            }
        });
        own.set(Some(handle));

        router.dispatch(&TestEvent::Ping(1));
        router.dispatch(&TestEvent::Ping(2));
        assert_eq!(calls.get(), 1);
    }
}
