use std::collections::BTreeSet;

use tandem::mutation::{
    ChangeListenerKey, EntityChange, MutationController, MutationId, PushOutcome, Tracked,
};

use super::{MutationFailure, ReconcileError, ReconcilerContext, resolve};
use crate::{
    api::AddToCart,
    entities::{Cart, CartLine},
    events::CartUpdate,
};

/// The user's cart. A full-cart push replaces every line; a line push sets one quantity.
/// Both are idempotent, so a repeated push changes nothing.
pub struct CartReconciler {
    context: ReconcilerContext,
    controller: MutationController<Cart>,
    key: String,
}

impl CartReconciler {
    pub fn new(context: ReconcilerContext) -> Self {
        // Quantities and prices are the server's call, the cart is always refreshed on login.
        let controller = context.controller(None);
        let key = context.user_key();
        Self {
            context,
            controller,
            key,
        }
    }

    pub fn current(&self) -> Tracked<Cart> {
        self.controller.current(&self.key)
    }

    pub fn subscribe(&self, listener: impl Fn(&EntityChange<Cart>) + 'static) -> ChangeListenerKey {
        self.controller.subscribe(listener)
    }

    pub fn unsubscribe(&self, key: ChangeListenerKey) -> bool {
        self.controller.unsubscribe(key)
    }

    pub fn apply_push(&self, update: &CartUpdate) -> Result<PushOutcome, ReconcileError> {
        validate(update).inspect_err(|e| log::warn!("Dropping cart push: {e}"))?;

        let outcome = match update.clone() {
            CartUpdate::Replace { items, updated_at } => {
                let cart = Cart::from_lines(items, Some(updated_at));
                self.controller.apply_push(&self.key, move |_| Some(cart))?
            }
            CartUpdate::Line { item_id, qty } => {
                self.controller.apply_push(&self.key, move |current| {
                    Some(current.cloned().unwrap_or_default().with_qty(&item_id, qty))
                })?
            }
        };
        Ok(outcome)
    }

    pub fn apply_mutation_result(
        &self,
        id: MutationId,
        response: Result<Cart, MutationFailure>,
    ) -> Result<Cart, MutationFailure> {
        resolve(&self.controller, id, response)
    }

    /// Adds `qty` of an item right away, then settles with the cart the server sends back.
    pub async fn add_item(&self, token: &str, item_id: &str, qty: u32) -> Result<Cart, MutationFailure> {
        let id = self.controller.begin(&self.key, |cart| {
            let qty = cart.qty(item_id).saturating_add(qty);
            cart.with_qty(item_id, qty)
        })?;

        let request = AddToCart {
            item_id: item_id.to_string(),
            qty,
        };
        let response = self
            .context
            .call(self.context.api.add_to_cart(token, request))
            .await;
        self.apply_mutation_result(id, response)
    }
}

fn validate(update: &CartUpdate) -> Result<(), ReconcileError> {
    match update {
        CartUpdate::Replace { items, .. } => {
            let mut seen = BTreeSet::new();
            for CartLine { item_id, .. } in items {
                if item_id.is_empty() {
                    return Err(ReconcileError::malformed::<Cart>("line without an item id"));
                }
                if !seen.insert(item_id.as_str()) {
                    return Err(ReconcileError::malformed::<Cart>(format!(
                        "item {item_id} appears twice"
                    )));
                }
            }
            Ok(())
        }
        CartUpdate::Line { item_id, .. } if item_id.is_empty() => {
            Err(ReconcileError::malformed::<Cart>("line without an item id"))
        }
        CartUpdate::Line { .. } => Ok(()),
    }
}
