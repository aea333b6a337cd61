//! Inbound request listener

use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::GrapevineConfig;
use crate::error::{GrapevineError, GrapevineResult};
use crate::transport::frame::{framed, Route, WireRequest, WireResponse};
use crate::types::Address;

/// Handles decoded requests for every route
///
/// The returned bytes are the postcard-encoded response message. An error
/// is sent back to the caller as [`WireResponse::Err`]; it never closes the
/// connection.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(
        &self,
        route: Route,
        body: Vec<u8>,
    ) -> impl Future<Output = GrapevineResult<Vec<u8>>> + Send;
}

/// Bound TCP listener, not yet serving
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    local_addr: Address,
    max_frame_bytes: usize,
}

impl Listener {
    /// Bind to `config.bind_ip`, probing upward from `config.port` while the
    /// port is taken. Port `0` asks the OS for a free port.
    pub async fn bind(config: &GrapevineConfig) -> GrapevineResult<Self> {
        let attempts = if config.port == 0 {
            1
        } else {
            config.port_search_limit.max(1)
        };

        let mut last_err = None;
        for offset in 0..attempts {
            let Some(port) = config.port.checked_add(offset) else {
                break;
            };
            match TcpListener::bind(SocketAddr::new(config.bind_ip, port)).await {
                Ok(listener) => {
                    let local_addr = Address::from(listener.local_addr()?);
                    info!(addr = %local_addr, "Listening for peers");
                    return Ok(Self {
                        listener,
                        local_addr,
                        max_frame_bytes: config.max_frame_bytes,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AddrInUse => {
                    debug!(port, "Port in use, trying next");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(GrapevineError::Transport(format!(
            "no free port from {} ({} tried): {}",
            config.port,
            attempts,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    /// Accept connections until `shutdown` flips to `true` or its sender is
    /// dropped. Open connections are closed on the same signal.
    pub async fn serve<H: RequestHandler>(
        self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        let shutdown = shutdown.clone();
                        let max_frame_bytes = self.max_frame_bytes;
                        tokio::spawn(async move {
                            serve_connection(stream, peer, handler, max_frame_bytes, shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(addr = %self.local_addr, "Listener stopped");
    }
}

async fn serve_connection<H: RequestHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let mut framed = framed(stream, max_frame_bytes);
    trace!(%peer, "Connection accepted");

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(%peer, error = %e, "Dropping connection after read error");
                break;
            }
            None => break,
        };

        let response = match WireRequest::decode(&frame) {
            Ok(request) => {
                trace!(%peer, route = %request.route, "Handling request");
                match handler.handle(request.route, request.body).await {
                    Ok(body) => WireResponse::Ok(body),
                    Err(e) => {
                        debug!(%peer, route = %request.route, error = %e, "Request failed");
                        WireResponse::Err(e.to_string())
                    }
                }
            }
            Err(e) => WireResponse::Err(format!("malformed request: {}", e)),
        };

        let bytes = match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%peer, error = %e, "Failed to encode response");
                break;
            }
        };
        if let Err(e) = framed.send(Bytes::from(bytes)).await {
            debug!(%peer, error = %e, "Failed to write response");
            break;
        }
    }

    trace!(%peer, "Connection closed");
}
