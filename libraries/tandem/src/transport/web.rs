//! Browser transports: a WebSocket, and HTTP long-polling for networks that block WebSockets.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use fetch_happen::Client;
use futures::{
    FutureExt, StreamExt,
    channel::{mpsc, oneshot},
    future::LocalBoxFuture,
};
use wasm_bindgen::{JsCast, JsValue, closure::Closure};
use web_sys::{CloseEvent, Event, MessageEvent, WebSocket};

use super::{Link, Transport, TransportError};

/// Close codes the server uses to reject a token after the handshake.
const AUTH_CLOSE_CODES: [u16; 2] = [4401, 1008];
const NORMAL_CLOSE: u16 = 1000;

fn network(e: JsValue) -> TransportError {
    TransportError::Network(e.as_string().unwrap_or_else(|| format!("{e:?}")))
}

/// `http://host/events` becomes `ws://host/events?token=...`.
pub(crate) fn websocket_url(url: &str, token: &str) -> String {
    let url = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    };
    let separator = if url.contains('?') { '&' } else { '?' };
    let token = String::from(js_sys::encode_uri_component(token));
    format!("{url}{separator}token={token}")
}

fn close_error(code: u16, reason: &str) -> TransportError {
    if AUTH_CLOSE_CODES.contains(&code) {
        TransportError::Unauthorized
    } else if code == NORMAL_CLOSE {
        TransportError::Closed
    } else {
        TransportError::Network(format!("socket closed with code {code}: {reason}"))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn open<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> LocalBoxFuture<'a, Result<Box<dyn Link>, TransportError>> {
        async move {
            let socket = WebSocket::new(&websocket_url(url, token)).map_err(network)?;
            let (frames_tx, frames) = mpsc::unbounded();
            let (opened_tx, opened_rx) = oneshot::channel::<Result<(), TransportError>>();
            let opened_tx = Rc::new(RefCell::new(Some(opened_tx)));

            let on_open = Closure::<dyn FnMut(Event)>::new({
                let opened_tx = opened_tx.clone();
                move |_: Event| {
                    if let Some(tx) = opened_tx.borrow_mut().take() {
                        let _ = tx.send(Ok(()));
                    }
                }
            });
            let on_message = Closure::<dyn FnMut(MessageEvent)>::new({
                let frames_tx = frames_tx.clone();
                move |event: MessageEvent| match event.data().as_string() {
                    Some(text) => {
                        let _ = frames_tx.unbounded_send(Ok(text));
                    }
                    None => log::warn!("Ignoring non-text WebSocket frame"),
                }
            });
            let on_close = Closure::<dyn FnMut(CloseEvent)>::new({
                let opened_tx = opened_tx.clone();
                move |event: CloseEvent| {
                    let error = close_error(event.code(), &event.reason());
                    // Before the open event, the close is the answer to `open` itself.
                    match opened_tx.borrow_mut().take() {
                        Some(tx) => {
                            let _ = tx.send(Err(error));
                        }
                        None => {
                            let _ = frames_tx.unbounded_send(Err(error));
                        }
                    }
                    frames_tx.close_channel();
                }
            });
            let on_error = Closure::<dyn FnMut(Event)>::new(|_: Event| {
                log::warn!("WebSocket error, waiting for the close event");
            });

            socket.set_onopen(Some(on_open.as_ref().unchecked_ref()));
            socket.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
            socket.set_onclose(Some(on_close.as_ref().unchecked_ref()));
            socket.set_onerror(Some(on_error.as_ref().unchecked_ref()));

            let link = WebSocketLink {
                socket,
                frames,
                _handlers: (on_open, on_message, on_close, on_error),
            };
            match opened_rx.await {
                Ok(Ok(())) => Ok(Box::new(link) as Box<dyn Link>),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TransportError::Network(
                    "socket went away before opening".to_string(),
                )),
            }
        }
        .boxed_local()
    }
}

struct WebSocketLink {
    socket: WebSocket,
    frames: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    _handlers: (
        Closure<dyn FnMut(Event)>,
        Closure<dyn FnMut(MessageEvent)>,
        Closure<dyn FnMut(CloseEvent)>,
        Closure<dyn FnMut(Event)>,
    ),
}

impl Link for WebSocketLink {
    fn recv(&mut self) -> LocalBoxFuture<'_, Option<Result<String, TransportError>>> {
        self.frames.next().boxed_local()
    }

    fn send(&mut self, frame: String) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        let result = self.socket.send_with_str(&frame).map_err(network);
        futures::future::ready(result).boxed_local()
    }

    fn close(&mut self) {
        self.socket.set_onopen(None);
        self.socket.set_onmessage(None);
        self.socket.set_onclose(None);
        self.socket.set_onerror(None);
        if let Err(e) = self.socket.close() {
            log::warn!("Failed to close WebSocket: {e:?}");
        }
        self.frames.close();
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(serde::Serialize)]
struct PollRequest<'a> {
    cursor: Option<&'a str>,
}

#[derive(serde::Serialize)]
struct SendRequest<'a> {
    frame: &'a str,
}

#[derive(serde::Deserialize)]
struct PollResponse {
    cursor: Option<String>,
    #[serde(default)]
    frames: Vec<String>,
}

/// Long-polling over two endpoints under the channel URL:
/// `POST {url}/poll` with `{"cursor": ...}` blocks until frames are available and returns
/// `{"cursor": ..., "frames": [...]}`, `POST {url}/send` takes `{"frame": ...}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongPollTransport;

async fn poll(url: String, token: String, cursor: Option<String>) -> Result<PollResponse, TransportError> {
    let response = Client
        .post(format!("{url}/poll"))
        .header("Authorization", format!("Bearer {token}"))
        .json(&PollRequest {
            cursor: cursor.as_deref(),
        })
        .map_err(|e| TransportError::Network(format!("{e:?}")))?
        .send()
        .await
        .map_err(|e| TransportError::Network(format!("{e:?}")))?;

    let status: u16 = response.status();
    if status == 401 || status == 403 {
        return Err(TransportError::Unauthorized);
    }
    if status == 204 {
        return Ok(PollResponse {
            cursor,
            frames: Vec::new(),
        });
    }
    if !response.ok() {
        return Err(TransportError::Network(format!("poll failed with status: {status}")));
    }

    let body = response
        .text()
        .await
        .map_err(|e| TransportError::Network(format!("{e:?}")))?;
    serde_json::from_str(&body)
        .map_err(|e| TransportError::Network(format!("unreadable poll response: {e}")))
}

impl Transport for LongPollTransport {
    fn open<'a>(
        &'a self,
        url: &'a str,
        token: &'a str,
    ) -> LocalBoxFuture<'a, Result<Box<dyn Link>, TransportError>> {
        async move {
            // The first poll doubles as the auth check.
            let first = poll(url.to_string(), token.to_string(), None).await?;
            let link = LongPollLink {
                url: url.to_string(),
                token: token.to_string(),
                cursor: first.cursor,
                buffered: first.frames.into(),
                in_flight: None,
                closed: false,
            };
            Ok(Box::new(link) as Box<dyn Link>)
        }
        .boxed_local()
    }
}

struct LongPollLink {
    url: String,
    token: String,
    cursor: Option<String>,
    buffered: VecDeque<String>,
    // Kept across cancelled `recv` calls so a response is never thrown away.
    in_flight: Option<LocalBoxFuture<'static, Result<PollResponse, TransportError>>>,
    closed: bool,
}

impl Link for LongPollLink {
    fn recv(&mut self) -> LocalBoxFuture<'_, Option<Result<String, TransportError>>> {
        async move {
            loop {
                if let Some(frame) = self.buffered.pop_front() {
                    return Some(Ok(frame));
                }
                if self.closed {
                    return None;
                }
                let request = self.in_flight.get_or_insert_with(|| {
                    poll(self.url.clone(), self.token.clone(), self.cursor.clone()).boxed_local()
                });
                let result = request.await;
                self.in_flight = None;
                match result {
                    Ok(response) => {
                        self.cursor = response.cursor;
                        self.buffered.extend(response.frames);
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
        }
        .boxed_local()
    }

    fn send(&mut self, frame: String) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        async move {
            if self.closed {
                return Err(TransportError::Closed);
            }
            let response = Client
                .post(format!("{}/send", self.url))
                .header("Authorization", format!("Bearer {}", self.token))
                .json(&SendRequest { frame: &frame })
                .map_err(|e| TransportError::Network(format!("{e:?}")))?
                .send()
                .await
                .map_err(|e| TransportError::Network(format!("{e:?}")))?;
            let status: u16 = response.status();
            match status {
                401 | 403 => Err(TransportError::Unauthorized),
                _ if response.ok() => Ok(()),
                _ => Err(TransportError::Network(format!("send failed with status: {status}"))),
            }
        }
        .boxed_local()
    }

    fn close(&mut self) {
        self.closed = true;
        self.in_flight = None;
        self.buffered.clear();
    }
}
