//! Shim supervision.
//!
//! A shim is an out-of-process helper that owns one task. The daemon starts
//! it through its binary, reads the bootstrap params the binary printed,
//! connects to the advertised address and from then on drives the task over
//! RPC.
//!
//! ```text
//! ┌──────────────────────────┐   start/delete    ┌──────────────────────┐
//! │ ShimManager              │ ────────────────► │ shim binary          │
//! │  NsMap<Arc<ShimTask>>    │                   │  prints bootstrap    │
//! │                          │   JSON-line RPC   │  params, then serves │
//! │  ShimTask ── ShimClient ─┼─────────────────► │  the task service    │
//! │                 │        │ ◄──── events ──── │                      │
//! └─────────────────┼────────┘                   └──────────────────────┘
//!                   │ connection lost
//!                   ▼
//!        cleanup_after_dead_shim ── TaskExit + TaskDelete
//! ```
//!
//! # Bootstrap Params
//!
//! Current shims print `{"Version":2,"Address":"unix:///…","Protocol":"ttrpc"}`.
//! Older shims print a bare address, which is treated as TTRPC. A version
//! newer than [`SHIM_BOOTSTRAP_VERSION`] is refused before anything is
//! dialed.

mod binary;
mod bundle;
mod cleanup;
mod client;
mod manager;
pub mod protocol;
mod task;

pub use binary::{BinaryCall, ShimBinary};
pub use bundle::Bundle;
pub use cleanup::cleanup_after_dead_shim;
pub use client::{ConnectivityState, OnClose, RpcChannel};
pub use manager::{CreateTaskOptions, ShimManager};
pub use protocol::{
    ConnectInfo, Exit, ExitStatus, Mount, ProcessInfo, Request, ResponseData, Signal, TaskState,
    TaskStatus,
};
pub use task::{Process, ShimProcess, ShimTask};

use crate::constants::{DIAL_TIMEOUT, LOAD_TIMEOUT, SHIM_BOOTSTRAP_VERSION};
use crate::error::{Error, Result};
use crate::events::Exchange;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

// =============================================================================
// Bootstrap Params
// =============================================================================

/// RPC protocol a shim serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ttrpc,
    Grpc,
}

/// Connection details printed by a shim binary's `start` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapParams {
    #[serde(rename = "Version")]
    pub version: i32,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Protocol")]
    pub protocol: Protocol,
}

impl BootstrapParams {
    /// Parses the output of a shim binary's `start` action.
    ///
    /// Output that is not JSON, or JSON with a version below 2, is a legacy
    /// shim: the whole output is the address and the protocol is TTRPC.
    pub fn parse(data: &str) -> Result<Self> {
        let data = data.trim();
        let params = match serde_json::from_str::<Self>(data) {
            Ok(params) if params.version >= 2 => params,
            parsed => Self {
                version: parsed.map(|p| p.version).unwrap_or(1),
                address: data.to_string(),
                protocol: Protocol::Ttrpc,
            },
        };
        if params.version > SHIM_BOOTSTRAP_VERSION {
            return Err(Error::NotImplemented(format!(
                "unsupported shim bootstrap version {}",
                params.version
            )));
        }
        Ok(params)
    }
}

/// Address a shim listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    Tcp(String),
}

impl Address {
    /// Parses `unix://<path>`, a bare absolute path, or `tcp://host:port`.
    pub fn parse(address: &str) -> Result<Self> {
        if let Some(path) = address.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::InvalidArgument("empty unix socket path".to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(host) = address.strip_prefix("tcp://") {
            if host.is_empty() {
                return Err(Error::InvalidArgument("empty tcp address".to_string()));
            }
            return Ok(Self::Tcp(host.to_string()));
        }
        if address.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(address)));
        }
        Err(Error::InvalidArgument(format!("unsupported shim address {address:?}")))
    }

    /// Dials the address and wraps the connection in a channel.
    async fn open(&self, events: Exchange, on_close: Option<OnClose>) -> Result<RpcChannel> {
        let name = self.to_string();
        let channel = match self {
            Self::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| self.connect_failed(&e))?;
                RpcChannel::new(name, stream, Some(events), on_close)
            }
            Self::Tcp(host) => {
                let stream = TcpStream::connect(host).await.map_err(|e| self.connect_failed(&e))?;
                RpcChannel::new(name, stream, Some(events), on_close)
            }
        };
        Ok(channel)
    }

    /// Dials and immediately drops a raw connection.
    async fn probe(&self) -> Result<()> {
        match self {
            Self::Unix(path) => drop(UnixStream::connect(path).await.map_err(|e| self.connect_failed(&e))?),
            Self::Tcp(host) => drop(TcpStream::connect(host).await.map_err(|e| self.connect_failed(&e))?),
        }
        Ok(())
    }

    fn connect_failed(&self, e: &std::io::Error) -> Error {
        Error::ConnectFailed {
            address: self.to_string(),
            reason: e.to_string(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(host) => write!(f, "tcp://{host}"),
        }
    }
}

// =============================================================================
// Clients
// =============================================================================

/// TTRPC connection. The channel itself reports the peer going away.
#[derive(Debug)]
pub struct TtrpcClient {
    channel: RpcChannel,
}

impl TtrpcClient {
    /// Dials `address`; `on_close` fires if the shim drops the connection.
    pub async fn connect(address: &Address, events: Exchange, on_close: OnClose) -> Result<Self> {
        let channel = address.open(events, Some(on_close)).await?;
        Ok(Self { channel })
    }
}

/// GRPC connection watched by a connectivity watcher.
#[derive(Debug)]
pub struct GrpcConn {
    channel: RpcChannel,
    watcher: JoinHandle<()>,
}

impl GrpcConn {
    /// Performs a fail-fast raw dial bounded by [`DIAL_TIMEOUT`], connects,
    /// then watches connectivity and fires `on_close` once the connection
    /// goes idle or shuts down.
    pub async fn connect(address: &Address, events: Exchange, on_close: OnClose) -> Result<Self> {
        timeout(DIAL_TIMEOUT, address.probe())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("dial {address}"),
                duration: DIAL_TIMEOUT,
            })??;

        let channel = address.open(events, None).await?;
        let mut state = channel.subscribe_state();
        let watched = channel.clone();
        let watcher = tokio::spawn(async move {
            let lost = state.wait_for(|s| s.is_terminal()).await.is_ok();
            if lost && !watched.is_closing() {
                debug!(address = %watched.address(), "grpc shim connection went idle");
                on_close();
            }
        });
        Ok(Self { channel, watcher })
    }
}

/// A connection to a shim over either protocol.
#[derive(Debug)]
pub enum ShimClient {
    Ttrpc(TtrpcClient),
    Grpc(GrpcConn),
}

impl ShimClient {
    /// Connects with the protocol the shim advertised.
    pub async fn connect(
        protocol: Protocol,
        address: &Address,
        events: Exchange,
        on_close: OnClose,
    ) -> Result<Self> {
        match protocol {
            Protocol::Ttrpc => Ok(Self::Ttrpc(TtrpcClient::connect(address, events, on_close).await?)),
            Protocol::Grpc => Ok(Self::Grpc(GrpcConn::connect(address, events, on_close).await?)),
        }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &RpcChannel {
        match self {
            Self::Ttrpc(client) => &client.channel,
            Self::Grpc(conn) => &conn.channel,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Ttrpc(_) => Protocol::Ttrpc,
            Self::Grpc(_) => Protocol::Grpc,
        }
    }

    /// Closes the connection without firing `on_close`.
    pub fn close(&self) {
        self.channel().close();
    }

    /// Waits for the close acknowledgement.
    pub async fn wait_closed(&self) {
        self.channel().wait_closed().await;
        if let Self::Grpc(conn) = self
            && !conn.watcher.is_finished()
        {
            conn.watcher.abort();
        }
    }
}

// =============================================================================
// Shim
// =============================================================================

/// A connected shim and the bundle of its task.
#[derive(Debug)]
pub struct Shim {
    bundle: Bundle,
    client: ShimClient,
}

impl Shim {
    pub fn namespace(&self) -> &str {
        self.bundle.namespace()
    }

    pub fn id(&self) -> &str {
        self.bundle.id()
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn client(&self) -> &ShimClient {
        &self.client
    }

    pub(crate) fn channel(&self) -> &RpcChannel {
        self.client.channel()
    }

    /// Closes the connection and waits until it is released.
    pub async fn close(&self) {
        self.client.close();
        self.client.wait_closed().await;
    }
}

/// Connects to the shim of `bundle`.
///
/// Reads the bootstrap params from the bundle's address file, refuses
/// versions newer than supported before dialing, connects with the
/// advertised protocol and validates the connection with a `connect` call
/// bounded by [`LOAD_TIMEOUT`]. On any failure after dialing, the
/// connection is closed before the error is returned.
pub async fn load_shim(bundle: Bundle, events: &Exchange, on_close: OnClose) -> Result<Shim> {
    let params = BootstrapParams::parse(&bundle.read_address()?)?;
    let address = Address::parse(&params.address)?;
    let client = ShimClient::connect(params.protocol, &address, events.clone(), on_close).await?;
    let shim = Shim { bundle, client };

    let request = Request::Connect {
        id: shim.id().to_string(),
    };
    let validated = match timeout(LOAD_TIMEOUT, shim.channel().call(request)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Timeout {
            operation: format!("connect to shim {}", address),
            duration: LOAD_TIMEOUT,
        }),
    };
    if let Err(e) = validated {
        warn!(namespace = %shim.namespace(), id = %shim.id(), error = %e, "shim failed validation");
        shim.close().await;
        return Err(e);
    }

    info!(
        namespace = %shim.namespace(),
        id = %shim.id(),
        address = %address,
        protocol = ?params.protocol,
        "shim loaded"
    );
    Ok(shim)
}
