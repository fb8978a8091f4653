//! Multiplexed JSON-line RPC channel to a shim.
//!
//! One [`RpcChannel`] owns one connection. Calls are written as request
//! frames tagged with a fresh id; a background reader matches response
//! frames back to the waiting caller and forwards event frames to the
//! [`Exchange`]. When the connection ends, every call still waiting fails
//! with [`Error::ConnectionClosed`] and so does every later call.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikd::shim::{RpcChannel, Request};
//!
//! let stream = tokio::net::UnixStream::connect("/run/shim.sock").await?;
//! let channel = RpcChannel::new("/run/shim.sock", stream, Some(events), None);
//! let state = channel.call(Request::State { id: "c1".into(), exec_id: None }).await?;
//! channel.close();
//! channel.wait_closed().await;
//! ```

use super::protocol::{Frame, Request, Response, ResponseData};
use crate::error::{Error, Result};
use crate::events::Exchange;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Notify, oneshot, watch};
use tracing::{debug, trace, warn};

/// Callback fired once when the shim side drops the connection.
pub type OnClose = Box<dyn FnOnce() + Send + 'static>;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Connectivity of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Dialing.
    Connecting,
    /// Connected and serving calls.
    Ready,
    /// The peer went away.
    Idle,
    /// Closed locally.
    Shutdown,
}

impl ConnectivityState {
    /// Returns true once the connection can no longer carry calls.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Shutdown)
    }
}

#[derive(Default)]
struct Pending {
    closed: bool,
    calls: HashMap<u64, oneshot::Sender<Response>>,
}

struct Inner {
    address: String,
    writer: tokio::sync::Mutex<Option<Writer>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    state: watch::Sender<ConnectivityState>,
    closing: AtomicBool,
    shutdown: Notify,
    on_close: Mutex<Option<OnClose>>,
}

/// Handle to a multiplexed shim connection. Clones share the connection.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

impl RpcChannel {
    /// Wraps an established connection and starts its reader.
    ///
    /// `on_close` fires once if the peer drops the connection; it does not
    /// fire after [`close`](Self::close) or [`mark_closing`](Self::mark_closing).
    pub fn new<S>(
        address: impl Into<String>,
        stream: S,
        events: Option<Exchange>,
        on_close: Option<OnClose>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (state, _) = watch::channel(ConnectivityState::Ready);
        let inner = Arc::new(Inner {
            address: address.into(),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
            state,
            closing: AtomicBool::new(false),
            shutdown: Notify::new(),
            on_close: Mutex::new(on_close),
        });
        tokio::spawn(read_loop(Arc::clone(&inner), reader, events));
        Self { inner }
    }

    /// Address the channel is connected to.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Current connectivity.
    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    /// Subscribes to connectivity changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    /// Sends `request` and waits for its response.
    ///
    /// The call is abandoned when the returned future is dropped; a late
    /// response is discarded by the reader.
    pub async fn call(&self, request: Request) -> Result<Option<ResponseData>> {
        let method = request.method();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.lock_pending()?;
            if pending.closed {
                return Err(Error::ConnectionClosed);
            }
            pending.calls.insert(id, tx);
        }
        let _pending = PendingGuard {
            inner: &self.inner,
            id,
        };

        let line = Frame::Request { id, request }.to_json_line()?;
        {
            let mut writer = self.inner.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(Error::ConnectionClosed);
            };
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                debug!(address = %self.inner.address, method, error = %e, "shim write failed");
                return Err(Error::ConnectionClosed);
            }
        }
        trace!(address = %self.inner.address, method, id, "shim request sent");

        match rx.await {
            Ok(Response::Ok(payload)) => Ok(payload.data),
            Ok(Response::Error(e)) => Err(Error::from_remote(e.code, e.message)),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Stops treating a connection loss as an unexpected shim death.
    pub fn mark_closing(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
    }

    /// Returns true once the channel was closed or marked as closing.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Closes the connection. Pending calls fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.mark_closing();
        self.inner.shutdown.notify_one();
    }

    /// Waits until the reader has finished and the connection is released.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }
}

impl Inner {
    fn lock_pending(&self) -> Result<std::sync::MutexGuard<'_, Pending>> {
        self.pending
            .lock()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))
    }

    fn complete(&self, id: u64, result: Response) {
        let waiter = match self.lock_pending() {
            Ok(mut pending) => pending.calls.remove(&id),
            Err(_) => None,
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => trace!(address = %self.address, id, "response for abandoned call"),
        }
    }

    async fn finish(&self) {
        if let Ok(mut pending) = self.lock_pending() {
            pending.closed = true;
            pending.calls.clear();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let closing = self.closing.load(Ordering::SeqCst);
        self.state.send_replace(if closing {
            ConnectivityState::Shutdown
        } else {
            ConnectivityState::Idle
        });

        if !closing {
            let on_close = self.on_close.lock().ok().and_then(|mut cb| cb.take());
            if let Some(on_close) = on_close {
                debug!(address = %self.address, "shim connection lost");
                on_close();
            }
        }
    }
}

/// Removes a pending call when its caller goes away.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.calls.remove(&self.id);
        }
    }
}

async fn read_loop<R>(inner: Arc<Inner>, reader: R, events: Option<Exchange>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            read = reader.read_line(&mut line) => read,
            () = inner.shutdown.notified() => break,
        };
        match read {
            Ok(0) => {
                debug!(address = %inner.address, "shim closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(address = %inner.address, error = %e, "shim connection failed");
                break;
            }
        }

        match Frame::from_json(&line) {
            Ok(Frame::Response { id, result }) => inner.complete(id, result),
            Ok(Frame::Event(envelope)) => {
                if let Some(events) = &events {
                    events.publish(&envelope.namespace, envelope.event);
                }
            }
            Ok(Frame::Request { id, request }) => {
                warn!(address = %inner.address, id, method = request.method(), "ignoring request from shim");
            }
            Err(e) => {
                warn!(address = %inner.address, error = %e, "ignoring malformed frame from shim");
            }
        }
    }

    inner.finish().await;
}
