//! # MutationController
//! Optimistic updates for one entity kind.
//!
//! A mutation is applied to the cache the moment it begins and stays pending until the caller
//! confirms or rolls it back. Mutations on a key form a chain in issuance order:
//! - each one's rollback snapshot is the proposed value of the pending mutation before it,
//! - the most recently issued one owns the key, and only the owner's resolution writes the cache,
//! - when a mutation resolves, the one after it inherits a rollback snapshot that skips it.
//!
//! Push events for a key with pending mutations are queued and merged, in arrival order,
//! once the chain is empty. That way a push never lands between an optimistic apply and its confirmation.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use slotmap::{SlotMap, new_key_type};

use crate::{Entity, cache::CacheStore};

new_key_type! {
    pub struct MutationId;
    pub struct ChangeListenerKey;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeCause {
    Optimistic,
    Confirmed,
    RolledBack,
    Push,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange<E> {
    pub key: String,
    pub value: Option<E>,
    /// True while a mutation on the key is unresolved; the value is provisional.
    pub pending: bool,
    pub cause: ChangeCause,
}

/// An entity value tagged with whether it's still provisional.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Tracked<E> {
    pub value: Option<E>,
    pub pending: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Applied,
    /// The merge produced nothing new.
    Unchanged,
    /// Held back until the key's pending mutations resolve.
    Queued,
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("unknown or already resolved mutation")]
    UnknownMutation,

    #[error("failed to serialize entity: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Folds a push into the current value. `None` leaves the value alone.
pub type Merge<E> = Box<dyn FnOnce(Option<&E>) -> Option<E>>;

type ChangeListener<E> = Rc<dyn Fn(&EntityChange<E>)>;

struct MutationRecord<E> {
    key: String,
    previous: Option<E>,
    proposed: E,
    // The pending mutation `previous` was taken from, if any.
    base: Option<MutationId>,
}

struct KeyState<E> {
    // Unresolved mutations, oldest first.
    chain: Vec<MutationId>,
    // Most recently issued mutation whose value the cache still shows.
    owner: Option<MutationId>,
    queued: VecDeque<Merge<E>>,
}

impl<E> Default for KeyState<E> {
    fn default() -> Self {
        Self {
            chain: Vec::new(),
            owner: None,
            queued: VecDeque::new(),
        }
    }
}

struct State<E> {
    mutations: SlotMap<MutationId, MutationRecord<E>>,
    keys: HashMap<String, KeyState<E>>,
    listeners: SlotMap<ChangeListenerKey, ChangeListener<E>>,
}

/// What resolving a mutation means for the cache.
enum Resolution<E> {
    Write(E),
    Restore(Option<E>),
    Keep,
}

pub struct MutationController<E: Entity> {
    cache: Rc<CacheStore>,
    ttl: Option<Duration>,
    queue_limit: usize,
    state: RefCell<State<E>>,
}

impl<E: Entity> MutationController<E> {
    pub fn new(cache: Rc<CacheStore>, ttl: Option<Duration>, queue_limit: usize) -> Self {
        Self {
            cache,
            ttl,
            queue_limit: queue_limit.max(1),
            state: RefCell::new(State {
                mutations: SlotMap::with_key(),
                keys: HashMap::new(),
                listeners: SlotMap::with_key(),
            }),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&EntityChange<E>) + 'static) -> ChangeListenerKey {
        self.state.borrow_mut().listeners.insert(Rc::new(listener))
    }

    pub fn unsubscribe(&self, key: ChangeListenerKey) -> bool {
        self.state.borrow_mut().listeners.remove(key).is_some()
    }

    pub fn current(&self, key: &str) -> Tracked<E> {
        Tracked {
            value: self.cached(key),
            pending: self.pending_count(key) > 0,
        }
    }

    pub fn pending_count(&self, key: &str) -> usize {
        self.state
            .borrow()
            .keys
            .get(key)
            .map_or(0, |state| state.chain.len())
    }

    pub fn queued_pushes(&self, key: &str) -> usize {
        self.state
            .borrow()
            .keys
            .get(key)
            .map_or(0, |state| state.queued.len())
    }

    pub fn is_stale(&self, key: &str) -> bool {
        self.cache.is_stale(&self.storage_key(key))
    }

    /// Applies `mutate` to the key's current value right away and returns the pending mutation.
    pub fn begin(
        &self,
        key: &str,
        mutate: impl FnOnce(E) -> E,
    ) -> Result<MutationId, MutationError> {
        let (previous, base) = {
            let state = self.state.borrow();
            let pending_owner = state
                .keys
                .get(key)
                .and_then(|key_state| key_state.owner)
                .and_then(|owner| Some((owner, state.mutations.get(owner)?)));
            match pending_owner {
                Some((owner, record)) => (Some(record.proposed.clone()), Some(owner)),
                None => (None, None),
            }
        };
        let previous = match base {
            Some(_) => previous,
            None => self.cached(key),
        };

        let proposed = mutate(previous.clone().unwrap_or_default());
        self.cache
            .set(&self.storage_key(key), &proposed, self.ttl)?;

        let id = {
            let mut state = self.state.borrow_mut();
            let id = state.mutations.insert(MutationRecord {
                key: key.to_string(),
                previous,
                proposed: proposed.clone(),
                base,
            });
            let key_state = state.keys.entry(key.to_string()).or_default();
            key_state.chain.push(id);
            key_state.owner = Some(id);
            id
        };
        log::debug!("Began {} mutation on {key}", E::KIND);

        self.notify(EntityChange {
            key: key.to_string(),
            value: Some(proposed),
            pending: true,
            cause: ChangeCause::Optimistic,
        });
        Ok(id)
    }

    /// Settles a mutation. `authoritative` is the server's copy; without it the optimistic value stands.
    pub fn confirm(&self, id: MutationId, authoritative: Option<E>) -> Result<(), MutationError> {
        let (key, settled, is_owner) = {
            let mut state = self.state.borrow_mut();
            let record = state
                .mutations
                .remove(id)
                .ok_or(MutationError::UnknownMutation)?;
            let settled = authoritative.unwrap_or(record.proposed);

            for (_, successor) in state.mutations.iter_mut() {
                if successor.base == Some(id) {
                    successor.previous = Some(settled.clone());
                    successor.base = None;
                }
            }

            let is_owner = match state.keys.get_mut(&record.key) {
                Some(key_state) => {
                    key_state.chain.retain(|pending| *pending != id);
                    let is_owner = key_state.owner == Some(id);
                    if is_owner {
                        key_state.owner = None;
                    }
                    is_owner
                }
                None => false,
            };
            (record.key, settled, is_owner)
        };

        let resolution = if is_owner {
            Resolution::Write(settled)
        } else {
            Resolution::Keep
        };
        self.settle(&key, resolution, ChangeCause::Confirmed)
    }

    /// Undoes a mutation. The cache goes back to the snapshot from before it, unless a newer
    /// mutation on the key has been issued since, in which case the newer one keeps the key.
    pub fn rollback(&self, id: MutationId) -> Result<(), MutationError> {
        let (key, resolution) = {
            let mut state = self.state.borrow_mut();
            let record = state
                .mutations
                .remove(id)
                .ok_or(MutationError::UnknownMutation)?;

            for (_, successor) in state.mutations.iter_mut() {
                if successor.base == Some(id) {
                    successor.previous = record.previous.clone();
                    successor.base = record.base;
                }
            }

            let is_owner = match state.keys.get_mut(&record.key) {
                Some(key_state) => {
                    key_state.chain.retain(|pending| *pending != id);
                    let is_owner = key_state.owner == Some(id);
                    if is_owner {
                        key_state.owner = record.base;
                    }
                    is_owner
                }
                None => false,
            };
            let resolution = if is_owner {
                Resolution::Restore(record.previous)
            } else {
                Resolution::Keep
            };
            (record.key, resolution)
        };

        log::info!("Rolled back {} mutation on {key}", E::KIND);
        self.settle(&key, resolution, ChangeCause::RolledBack)
    }

    /// Merges a push into the key, or queues it if the key has pending mutations.
    pub fn apply_push(
        &self,
        key: &str,
        merge: impl FnOnce(Option<&E>) -> Option<E> + 'static,
    ) -> Result<PushOutcome, MutationError> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(key_state) = state.keys.get_mut(key)
                && !key_state.chain.is_empty()
            {
                if key_state.queued.len() >= self.queue_limit {
                    key_state.queued.pop_front();
                    log::warn!(
                        "Push queue for {} {key} is full, dropping the oldest event",
                        E::KIND
                    );
                }
                key_state.queued.push_back(Box::new(merge));
                return Ok(PushOutcome::Queued);
            }
        }
        self.apply_merge(key, Box::new(merge))
    }

    fn settle(
        &self,
        key: &str,
        resolution: Resolution<E>,
        cause: ChangeCause,
    ) -> Result<(), MutationError> {
        let still_pending = self.pending_count(key) > 0;
        let storage_key = self.storage_key(key);
        let value = match resolution {
            Resolution::Write(value) => {
                self.cache.set(&storage_key, &value, self.ttl)?;
                Some(value)
            }
            Resolution::Restore(Some(value)) => {
                self.cache.set(&storage_key, &value, self.ttl)?;
                Some(value)
            }
            Resolution::Restore(None) => {
                self.cache.remove(&storage_key);
                None
            }
            // The value didn't change, but the pending marker may have.
            Resolution::Keep if !still_pending => self.cached(key),
            Resolution::Keep => {
                return Ok(());
            }
        };

        self.notify(EntityChange {
            key: key.to_string(),
            value,
            pending: still_pending,
            cause,
        });

        if !still_pending {
            self.drain_queue(key);
        }
        Ok(())
    }

    fn drain_queue(&self, key: &str) {
        loop {
            let merge = {
                let mut state = self.state.borrow_mut();
                let Some(key_state) = state.keys.get_mut(key) else {
                    return;
                };
                // A listener may have started a new mutation while we were draining.
                if !key_state.chain.is_empty() {
                    return;
                }
                match key_state.queued.pop_front() {
                    Some(merge) => merge,
                    None => {
                        state.keys.remove(key);
                        return;
                    }
                }
            };
            if let Err(e) = self.apply_merge(key, merge) {
                log::error!("Failed to apply queued push to {} {key}: {e}", E::KIND);
            }
        }
    }

    fn apply_merge(&self, key: &str, merge: Merge<E>) -> Result<PushOutcome, MutationError> {
        let current = self.cached(key);
        let Some(merged) = merge(current.as_ref()) else {
            return Ok(PushOutcome::Unchanged);
        };
        if current.as_ref() == Some(&merged) {
            return Ok(PushOutcome::Unchanged);
        }

        self.cache.set(&self.storage_key(key), &merged, self.ttl)?;
        self.notify(EntityChange {
            key: key.to_string(),
            value: Some(merged),
            pending: false,
            cause: ChangeCause::Push,
        });
        Ok(PushOutcome::Applied)
    }

    fn cached(&self, key: &str) -> Option<E> {
        self.cache
            .get::<E>(&self.storage_key(key))
            .map(|entry| entry.value)
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{key}", E::KIND)
    }

    fn notify(&self, change: EntityChange<E>) {
        let listeners: Vec<ChangeListener<E>> =
            self.state.borrow().listeners.values().cloned().collect();
        for listener in listeners {
            listener(&change);
        }
    }
}
