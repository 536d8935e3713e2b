//! Client-side sync for the storefront: keeps carts, favorites, balances and orders in step with
//! the server over long-lived channels, with optimistic updates that roll back on failure.

pub mod api;
pub mod config;
pub mod entities;
pub mod events;
pub mod reconcile;
pub mod session;
pub mod shell;
#[cfg(target_arch = "wasm32")]
mod web;

pub use config::StorefrontConfig;
pub use session::Session;
pub use shell::{ChannelStates, Services, SessionScope, Storefront, StorefrontError};
