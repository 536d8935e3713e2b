use tandem::mutation::{
    ChangeListenerKey, EntityChange, MutationController, MutationId, PushOutcome, Tracked,
};

use super::{MutationFailure, ReconcileError, ReconcilerContext, resolve, roll_back};
use crate::{
    api::{PaymentReceipt, PaymentRequest},
    entities::Balance,
};

/// The user's wallet balance. Pushes are last-write-wins by server timestamp: anything not newer
/// than what's cached is ignored, which also makes replays harmless.
pub struct BalanceReconciler {
    context: ReconcilerContext,
    controller: MutationController<Balance>,
    key: String,
}

impl BalanceReconciler {
    pub fn new(context: ReconcilerContext) -> Self {
        let controller = context.controller(context.cache_ttl);
        let key = context.user_key();
        Self {
            context,
            controller,
            key,
        }
    }

    pub fn current(&self) -> Tracked<Balance> {
        self.controller.current(&self.key)
    }

    pub fn is_stale(&self) -> bool {
        self.controller.is_stale(&self.key)
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&EntityChange<Balance>) + 'static,
    ) -> ChangeListenerKey {
        self.controller.subscribe(listener)
    }

    pub fn unsubscribe(&self, key: ChangeListenerKey) -> bool {
        self.controller.unsubscribe(key)
    }

    pub fn apply_push(&self, update: &Balance) -> Result<PushOutcome, ReconcileError> {
        let is_currency_code =
            update.currency.len() == 3 && update.currency.bytes().all(|b| b.is_ascii_uppercase());
        if !is_currency_code {
            let e = ReconcileError::malformed::<Balance>(format!(
                "{:?} is not a currency code",
                update.currency
            ));
            log::warn!("Dropping balance push: {e}");
            return Err(e);
        }
        let Some(updated_at) = update.updated_at else {
            let e = ReconcileError::malformed::<Balance>("missing updatedAt");
            log::warn!("Dropping balance push: {e}");
            return Err(e);
        };

        let update = update.clone();
        Ok(self.controller.apply_push(&self.key, move |current| {
            let newer = current
                .and_then(|balance| balance.updated_at)
                .is_none_or(|cached_at| updated_at > cached_at);
            newer.then_some(update)
        })?)
    }

    pub fn apply_mutation_result(
        &self,
        id: MutationId,
        response: Result<Balance, MutationFailure>,
    ) -> Result<Balance, MutationFailure> {
        resolve(&self.controller, id, response)
    }

    /// Deducts the amount right away. The receipt's balance (after any fees) replaces the guess.
    pub async fn pay(
        &self,
        token: &str,
        order_id: &str,
        amount_cents: i64,
    ) -> Result<PaymentReceipt, MutationFailure> {
        let id = self.controller.begin(&self.key, |balance| Balance {
            amount_cents: balance.amount_cents.saturating_sub(amount_cents),
            ..balance
        })?;

        let request = PaymentRequest {
            order_id: order_id.to_string(),
            amount_cents,
        };
        let response = self
            .context
            .call(self.context.api.pay_with_balance(token, request))
            .await;
        match response {
            Ok(receipt) => {
                self.apply_mutation_result(id, Ok(receipt.balance.clone()))?;
                Ok(receipt)
            }
            Err(failure) => {
                roll_back(&self.controller, id, &failure);
                Err(failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use chrono::{TimeZone, Utc};
    use futures::executor::block_on;

    use super::*;
    use crate::{api::ApiError, reconcile::test_support::context};

    fn balance(amount_cents: i64, minute: u32) -> Balance {
        Balance {
            amount_cents,
            currency: "EUR".to_string(),
            updated_at: Some(Utc.with_ymd_and_hms(2025, 1, 1, 12, minute, 0).unwrap()),
        }
    }

    #[test]
    fn newer_push_wins() {
        let reconciler = BalanceReconciler::new(context("u1"));

        reconciler.apply_push(&balance(500, 1)).unwrap();
        assert_eq!(
            reconciler.apply_push(&balance(900, 0)).unwrap(),
            PushOutcome::Unchanged
        );
        assert_eq!(
            reconciler.apply_push(&balance(700, 2)).unwrap(),
            PushOutcome::Applied
        );

        assert_eq!(reconciler.current().value.unwrap().amount_cents, 700);
    }

    #[test]
    fn push_without_a_valid_currency_is_rejected() {
        let reconciler = BalanceReconciler::new(context("u1"));
        let mut update = balance(500, 1);
        update.currency = "euro".to_string();

        assert!(reconciler.apply_push(&update).is_err());

        update.currency = "EUR".to_string();
        update.updated_at = None;
        assert!(reconciler.apply_push(&update).is_err());
        assert_eq!(reconciler.current().value, None);
    }

    #[test]
    fn absurd_payment_amount_saturates_instead_of_overflowing() {
        let reconciler = BalanceReconciler::new(context("u1"));
        reconciler.apply_push(&balance(-500, 1)).unwrap();
        let guesses = Rc::new(RefCell::new(Vec::new()));
        reconciler.subscribe({
            let guesses = guesses.clone();
            move |change| {
                guesses
                    .borrow_mut()
                    .push(change.value.as_ref().map(|b| b.amount_cents))
            }
        });

        let result = block_on(reconciler.pay("tok", "o1", i64::MAX));

        assert!(matches!(
            result,
            Err(MutationFailure::Api(ApiError::Network(_)))
        ));
        assert_eq!(*guesses.borrow(), vec![Some(i64::MIN), Some(-500)]);
        let current = reconciler.current();
        assert_eq!(current.value.unwrap().amount_cents, -500);
        assert!(!current.pending);
    }
}
