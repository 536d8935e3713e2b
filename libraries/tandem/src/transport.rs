//! Duplex links to the server. A [`Transport`] opens authenticated [`Link`]s; the connection
//! manager owns the link and decides what to do when it breaks.

use futures::{FutureExt, future::LocalBoxFuture};

#[cfg(all(target_arch = "wasm32", feature = "web"))]
mod web;
#[cfg(all(target_arch = "wasm32", feature = "web"))]
pub use web::{LongPollTransport, WebSocketTransport};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server refused the token. Retrying with the same token is pointless.
    #[error("the server rejected the session token")]
    Unauthorized,

    #[error("network error: {0}")]
    Network(String),

    #[error("the connection was closed")]
    Closed,
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Unauthorized)
    }
}

pub trait Transport {
    fn open<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> LocalBoxFuture<'a, Result<Box<dyn Link>, TransportError>>;
}

/// One open connection.
pub trait Link {
    /// Next inbound frame, or `None` once the link is closed.
    /// Dropping the returned future must not lose a frame.
    fn recv(&mut self) -> LocalBoxFuture<'_, Option<Result<String, TransportError>>>;

    fn send(&mut self, frame: String) -> LocalBoxFuture<'_, Result<(), TransportError>>;

    fn close(&mut self);
}

/// Tries `primary` first and falls back to `secondary` when it can't be reached.
/// A rejected token is final, it never falls back.
pub struct FallbackTransport<P, S> {
    primary: P,
    secondary: S,
}

impl<P: Transport, S: Transport> FallbackTransport<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

impl<P: Transport, S: Transport> Transport for FallbackTransport<P, S> {
    fn open<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> LocalBoxFuture<'a, Result<Box<dyn Link>, TransportError>> {
        async move {
            match self.primary.open(url, token).await {
                Err(TransportError::Network(reason)) => {
                    log::info!("Primary transport unavailable ({reason}), falling back");
                    self.secondary.open(url, token).await
                }
                other => other,
            }
        }
        .boxed_local()
    }
}

impl<T: Transport + ?Sized> Transport for std::rc::Rc<T> {
    fn open<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> LocalBoxFuture<'a, Result<Box<dyn Link>, TransportError>> {
        (**self).open(url, token)
    }
}
