//! One reconciler per entity kind. Each turns pushes and REST results into merges through its
//! [`MutationController`], and runs the optimistic flows for its entity.
//!
//! Reconcilers never write the cache directly; everything goes through the controller so pushes
//! and mutations on a key are serialized.

mod balance;
mod cart;
mod favorites;
mod orders;

use std::{rc::Rc, time::Duration};

use futures::future::LocalBoxFuture;
use tandem::{
    Entity,
    cache::CacheStore,
    mutation::{MutationController, MutationError, MutationId},
    runtime::{Timer, with_timeout},
};

pub use balance::BalanceReconciler;
pub use cart::CartReconciler;
pub use favorites::FavoriteReconciler;
pub use orders::OrdersReconciler;

use crate::api::{ApiError, CommerceApi};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error(transparent)]
    Mutation(#[from] MutationError),
}

impl ReconcileError {
    fn malformed<E: Entity>(reason: impl Into<String>) -> Self {
        ReconcileError::Malformed {
            kind: E::KIND,
            reason: reason.into(),
        }
    }
}

/// Why an optimistic update was rolled back.
#[derive(Debug, thiserror::Error)]
pub enum MutationFailure {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("the request timed out")]
    TimedOut,

    #[error(transparent)]
    Mutation(#[from] MutationError),
}

impl MutationFailure {
    /// True if the user has to log in again.
    pub fn is_auth(&self) -> bool {
        matches!(self, MutationFailure::Api(ApiError::Unauthorized))
    }
}

/// What every reconciler of a session shares.
#[derive(Clone)]
pub struct ReconcilerContext {
    pub cache: Rc<CacheStore>,
    pub api: Rc<dyn CommerceApi>,
    pub timer: Rc<dyn Timer>,
    pub user_id: String,
    pub request_timeout: Duration,
    pub cache_ttl: Option<Duration>,
    pub push_queue_limit: usize,
}

impl ReconcilerContext {
    fn controller<E: Entity>(&self, ttl: Option<Duration>) -> MutationController<E> {
        MutationController::new(self.cache.clone(), ttl, self.push_queue_limit)
    }

    /// Keys for entities that exist once per user.
    fn user_key(&self) -> String {
        self.user_id.clone()
    }

    fn scoped_key(&self, id: &str) -> String {
        format!("{}:{id}", self.user_id)
    }

    async fn call<T>(
        &self,
        request: LocalBoxFuture<'static, Result<T, ApiError>>,
    ) -> Result<T, MutationFailure> {
        match with_timeout(&*self.timer, self.request_timeout, request).await {
            Some(result) => Ok(result?),
            None => Err(MutationFailure::TimedOut),
        }
    }
}

/// Confirms with the server's copy on success, rolls back otherwise.
fn resolve<E: Entity>(
    controller: &MutationController<E>,
    id: MutationId,
    response: Result<E, MutationFailure>,
) -> Result<E, MutationFailure> {
    match response {
        Ok(authoritative) => {
            controller.confirm(id, Some(authoritative.clone()))?;
            Ok(authoritative)
        }
        Err(failure) => {
            roll_back(controller, id, &failure);
            Err(failure)
        }
    }
}

fn roll_back<E: Entity>(controller: &MutationController<E>, id: MutationId, failure: &MutationFailure) {
    log::warn!("{} update failed, rolling back: {failure}", E::KIND);
    if let Err(e) = controller.rollback(id) {
        log::error!("Failed to roll back {} update: {e}", E::KIND);
    }
}
