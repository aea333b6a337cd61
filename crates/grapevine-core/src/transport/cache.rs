//! Outbound connection cache
//!
//! Keeps at most one idle framed TCP connection per peer address. A request
//! checks the idle connection out, uses it, and checks it back in; a request
//! that finds the peer's connection busy opens a fresh one rather than
//! waiting. Every use pushes the freshness window out, and every call first
//! closes connections whose window has lapsed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::GrapevineConfig;
use crate::error::{GrapevineError, GrapevineResult};
use crate::transport::frame::{framed, FramedStream, Route, WireRequest, WireResponse};
use crate::types::Address;

struct CachedClient {
    /// `None` while the connection is checked out
    stream: Option<FramedStream>,
    expires_at: Instant,
}

/// Outcome of one attempt on one connection
enum Attempt {
    /// The connection was already dead; safe to retry on a new one
    Stale(String),
    Failed(GrapevineError),
}

/// Cache of outbound peer connections, shared by gossip and shared data
pub struct ConnectionCache {
    clients: Mutex<HashMap<Address, CachedClient>>,
    ttl: Duration,
    timeout: Duration,
    max_frame_bytes: usize,
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("clients", &self.len())
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ConnectionCache {
    pub fn new(config: &GrapevineConfig) -> Self {
        Self::with_settings(
            config.client_ttl(),
            config.request_timeout(),
            config.max_frame_bytes,
        )
    }

    pub fn with_settings(ttl: Duration, timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            ttl,
            timeout,
            max_frame_bytes,
        }
    }

    /// Send `req` to `route` on the peer at `addr` and decode its response
    pub async fn request<Req, Resp>(
        &self,
        addr: &Address,
        route: Route,
        req: &Req,
    ) -> GrapevineResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = postcard::to_allocvec(req)?;
        let frame = Bytes::from(WireRequest { route, body }.encode()?);

        trace!(peer = %addr, %route, bytes = frame.len(), "Sending request");

        // A timed-out exchange drops its checked-out stream with it
        let response = match tokio::time::timeout(self.timeout, self.exchange(addr, frame)).await
        {
            Ok(response) => response?,
            Err(_) => return Err(GrapevineError::Timeout(format!("{}{}", addr, route))),
        };

        match response {
            WireResponse::Ok(bytes) => Ok(postcard::from_bytes(&bytes)?),
            WireResponse::Err(message) => Err(GrapevineError::Remote(message)),
        }
    }

    async fn exchange(&self, addr: &Address, frame: Bytes) -> GrapevineResult<WireResponse> {
        self.evict_stale();

        if let Some(stream) = self.check_out(addr) {
            match Self::round_trip(stream, frame.clone()).await {
                Ok((stream, response)) => {
                    self.check_in(addr, stream);
                    return Ok(response);
                }
                Err(Attempt::Stale(reason)) => {
                    debug!(peer = %addr, %reason, "Cached connection is stale, reconnecting");
                }
                Err(Attempt::Failed(e)) => return Err(e),
            }
        }

        let stream = self.connect(addr).await?;
        match Self::round_trip(stream, frame).await {
            Ok((stream, response)) => {
                self.check_in(addr, stream);
                Ok(response)
            }
            Err(Attempt::Stale(reason)) => {
                Err(GrapevineError::Transport(format!("{}: {}", addr, reason)))
            }
            Err(Attempt::Failed(e)) => Err(e),
        }
    }

    /// Take the idle connection to `addr`, refreshing its window
    fn check_out(&self, addr: &Address) -> Option<FramedStream> {
        let mut clients = self.clients.lock();
        let client = clients.get_mut(addr)?;
        client.expires_at = Instant::now() + self.ttl;
        client.stream.take()
    }

    /// Return a healthy connection; a surplus one is dropped
    fn check_in(&self, addr: &Address, stream: FramedStream) {
        let expires_at = Instant::now() + self.ttl;
        let mut clients = self.clients.lock();
        let client = clients.entry(*addr).or_insert(CachedClient {
            stream: None,
            expires_at,
        });
        client.expires_at = expires_at;
        if client.stream.is_none() {
            client.stream = Some(stream);
        }
    }

    async fn connect(&self, addr: &Address) -> GrapevineResult<FramedStream> {
        let stream = TcpStream::connect(addr.socket_addr())
            .await
            .map_err(|e| GrapevineError::Transport(format!("connect {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        debug!(peer = %addr, "Opened connection");
        Ok(framed(stream, self.max_frame_bytes))
    }

    /// One request/response on `stream`; the stream comes back only on success
    async fn round_trip(
        mut stream: FramedStream,
        frame: Bytes,
    ) -> Result<(FramedStream, WireResponse), Attempt> {
        stream
            .send(frame)
            .await
            .map_err(|e| Attempt::Stale(format!("send failed: {}", e)))?;

        let reply = match stream.next().await {
            Some(Ok(reply)) => reply,
            Some(Err(e)) if is_disconnect(&e) => {
                return Err(Attempt::Stale(format!("read failed: {}", e)))
            }
            Some(Err(e)) => {
                return Err(Attempt::Failed(GrapevineError::Transport(format!(
                    "read failed: {}",
                    e
                ))))
            }
            None => return Err(Attempt::Stale("closed by peer".to_string())),
        };

        let response = WireResponse::decode(&reply)
            .map_err(|e| Attempt::Failed(GrapevineError::Serialization(e.to_string())))?;

        Ok((stream, response))
    }

    /// Close connections whose freshness window has lapsed
    pub fn evict_stale(&self) -> usize {
        let now = Instant::now();
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|addr, client| {
            let keep = client.expires_at > now;
            if !keep {
                trace!(peer = %addr, "Closing idle connection");
            }
            keep
        });
        before - clients.len()
    }

    /// Forget the cached connection to `addr`, if any
    pub fn close(&self, addr: &Address) {
        self.clients.lock().remove(addr);
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::transport::server::{Listener, RequestHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    impl RequestHandler for Echo {
        async fn handle(&self, route: Route, body: Vec<u8>) -> GrapevineResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match route {
                Route::Gossip => Ok(body),
                _ => Err(GrapevineError::Remote("unsupported".into())),
            }
        }
    }

    async fn echo_server() -> (Address, Arc<Echo>, tokio::sync::watch::Sender<bool>) {
        let listener = Listener::bind(&GrapevineConfig::ephemeral()).await.unwrap();
        let addr = listener.local_addr();
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(listener.serve(handler.clone(), rx));
        (addr, handler, tx)
    }

    #[tokio::test]
    async fn test_request_reuses_connection() {
        let (addr, handler, _shutdown) = echo_server().await;
        let cache = ConnectionCache::new(&GrapevineConfig::ephemeral());

        let first: String = cache.request(&addr, Route::Gossip, "hello").await.unwrap();
        let second: String = cache.request(&addr, Route::Gossip, "again").await.unwrap();

        assert_eq!(first, "hello");
        assert_eq!(second, "again");
        assert_eq!(cache.len(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_to_one_peer() {
        let (addr, handler, _shutdown) = echo_server().await;
        let cache = ConnectionCache::new(&GrapevineConfig::ephemeral());

        let replies: Vec<String> = futures::future::join_all(
            ["a", "b", "c", "d"]
                .iter()
                .map(|msg| cache.request::<_, String>(&addr, Route::Gossip, *msg)),
        )
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

        assert_eq!(replies, vec!["a", "b", "c", "d"]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let (addr, _handler, _shutdown) = echo_server().await;
        let cache = ConnectionCache::new(&GrapevineConfig::ephemeral());

        let err = cache
            .request::<_, String>(&addr, Route::Set, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, GrapevineError::Remote(_)));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let cache = ConnectionCache::new(&GrapevineConfig::ephemeral());

        let err = cache
            .request::<_, String>(&Address::localhost(port), Route::Gossip, "x")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GrapevineError::Transport(_) | GrapevineError::Timeout(_)
        ));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_idle_connections_evicted() {
        let (addr, _handler, _shutdown) = echo_server().await;
        let cache = ConnectionCache::with_settings(
            Duration::from_millis(20),
            Duration::from_secs(2),
            1024 * 1024,
        );

        let _: String = cache.request(&addr, Route::Gossip, "x").await.unwrap();
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.evict_stale(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_reconnects_after_server_restart() {
        let (addr, _handler, shutdown) = echo_server().await;
        let cache = ConnectionCache::new(&GrapevineConfig::ephemeral());
        let _: String = cache.request(&addr, Route::Gossip, "x").await.unwrap();

        // Stop the first server and start another on the same port
        shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut config = GrapevineConfig::ephemeral();
        config.port = addr.port;
        config.port_search_limit = 1;
        let listener = Listener::bind(&config).await.unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(listener.serve(
            Arc::new(Echo {
                calls: AtomicUsize::new(0),
            }),
            rx,
        ));

        let reply: String = cache.request(&addr, Route::Gossip, "y").await.unwrap();
        assert_eq!(reply, "y");
    }
}
