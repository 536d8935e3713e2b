use tandem::mutation::{
    ChangeListenerKey, EntityChange, MutationController, MutationId, PushOutcome, Tracked,
};

use super::{MutationFailure, ReconcileError, ReconcilerContext, resolve};
use crate::{entities::Favorite, events::FavoriteUpdate};

/// Favorite flag and count per product. The server's flag and count always replace ours.
pub struct FavoriteReconciler {
    context: ReconcilerContext,
    controller: MutationController<Favorite>,
}

impl FavoriteReconciler {
    pub fn new(context: ReconcilerContext) -> Self {
        let controller = context.controller(None);
        Self {
            context,
            controller,
        }
    }

    pub fn current(&self, product_id: &str) -> Tracked<Favorite> {
        self.controller.current(&self.context.scoped_key(product_id))
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&EntityChange<Favorite>) + 'static,
    ) -> ChangeListenerKey {
        self.controller.subscribe(listener)
    }

    pub fn unsubscribe(&self, key: ChangeListenerKey) -> bool {
        self.controller.unsubscribe(key)
    }

    pub fn apply_push(&self, update: &FavoriteUpdate) -> Result<PushOutcome, ReconcileError> {
        if update.product_id.is_empty() {
            let e = ReconcileError::malformed::<Favorite>("missing product id");
            log::warn!("Dropping favorite push: {e}");
            return Err(e);
        }
        if update.favorited && update.count == 0 {
            let e = ReconcileError::malformed::<Favorite>(format!(
                "{} is favorited but has a count of 0",
                update.product_id
            ));
            log::warn!("Dropping favorite push: {e}");
            return Err(e);
        }

        let favorite = Favorite {
            favorited: update.favorited,
            count: update.count,
        };
        Ok(self
            .controller
            .apply_push(&self.context.scoped_key(&update.product_id), move |_| {
                Some(favorite)
            })?)
    }

    pub fn apply_mutation_result(
        &self,
        id: MutationId,
        response: Result<Favorite, MutationFailure>,
    ) -> Result<Favorite, MutationFailure> {
        resolve(&self.controller, id, response)
    }

    /// Flips the flag (and the count with it) right away, then settles with the server's answer.
    pub async fn toggle(&self, token: &str, product_id: &str) -> Result<Favorite, MutationFailure> {
        let mut favorited = false;
        let id = self
            .controller
            .begin(&self.context.scoped_key(product_id), |favorite| {
                let toggled = favorite.toggled();
                favorited = toggled.favorited;
                toggled
            })?;

        let response = self
            .context
            .call(self.context.api.set_favorite(token, product_id, favorited))
            .await;
        self.apply_mutation_result(id, response)
    }
}
