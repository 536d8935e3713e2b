use tandem::mutation::{ChangeListenerKey, EntityChange, MutationController, PushOutcome, Tracked};

use super::{ReconcileError, ReconcilerContext};
use crate::entities::Order;

/// Orders by id, last-write-wins on the server's `updatedAt`.
/// Orders only change server-side, so there are no optimistic flows here.
pub struct OrdersReconciler {
    context: ReconcilerContext,
    controller: MutationController<Order>,
}

impl OrdersReconciler {
    pub fn new(context: ReconcilerContext) -> Self {
        let controller = context.controller(context.cache_ttl);
        Self {
            context,
            controller,
        }
    }

    pub fn current(&self, order_id: &str) -> Tracked<Order> {
        self.controller.current(&self.context.scoped_key(order_id))
    }

    pub fn is_stale(&self, order_id: &str) -> bool {
        self.controller.is_stale(&self.context.scoped_key(order_id))
    }

    pub fn subscribe(&self, listener: impl Fn(&EntityChange<Order>) + 'static) -> ChangeListenerKey {
        self.controller.subscribe(listener)
    }

    pub fn unsubscribe(&self, key: ChangeListenerKey) -> bool {
        self.controller.unsubscribe(key)
    }

    /// Used for pushes and for orders that come back from REST calls, like a payment receipt.
    pub fn apply_push(&self, order: &Order) -> Result<PushOutcome, ReconcileError> {
        if order.order_id.is_empty() {
            let e = ReconcileError::malformed::<Order>("missing order id");
            log::warn!("Dropping order push: {e}");
            return Err(e);
        }

        let order = order.clone();
        let key = self.context.scoped_key(&order.order_id);
        Ok(self.controller.apply_push(&key, move |current| {
            let newer = current.is_none_or(|cached| order.updated_at > cached.updated_at);
            newer.then_some(order)
        })?)
    }
}
