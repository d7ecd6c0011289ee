//! Raw stream transports for `tcp` and `udp` routes

use crate::error::RouteError;
use crate::route::Scheme;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UDP_SESSION_IDLE: Duration = Duration::from_secs(60);
const UDP_SESSION_BUFFER: usize = 64;
const UDP_MAX_DATAGRAM: usize = 65_535;

/// One accepted client
pub enum StreamConn {
    Tcp {
        stream: TcpStream,
        peer: SocketAddr,
    },
    /// First datagram of a new UDP peer; later datagrams arrive on `rx`
    Udp {
        peer: SocketAddr,
        first: Vec<u8>,
        rx: mpsc::Receiver<Vec<u8>>,
        socket: Arc<UdpSocket>,
    },
}

impl StreamConn {
    pub fn peer(&self) -> SocketAddr {
        match self {
            StreamConn::Tcp { peer, .. } | StreamConn::Udp { peer, .. } => *peer,
        }
    }
}

/// Listening side of a stream route
#[async_trait]
pub trait Stream: Send + Sync {
    /// Bind the listener
    async fn setup(&self) -> Result<(), RouteError>;

    async fn accept(&self) -> io::Result<StreamConn>;

    /// Serve one client until either side closes or `cancel` fires
    async fn handle(&self, conn: StreamConn, cancel: CancellationToken);

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Release the listener
    fn close(&self) {}
}

/// Build the transport for a stream scheme
pub fn new_stream(scheme: Scheme, listen: SocketAddr, target: String) -> Option<Arc<dyn Stream>> {
    match scheme {
        Scheme::Tcp => Some(Arc::new(TcpProxy::new(listen, target))),
        Scheme::Udp => Some(Arc::new(UdpProxy::new(listen, target))),
        Scheme::Http => None,
    }
}

fn not_set_up() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener closed")
}

pub struct TcpProxy {
    listen: SocketAddr,
    target: String,
    listener: Mutex<Option<Arc<TcpListener>>>,
}

impl TcpProxy {
    pub fn new(listen: SocketAddr, target: String) -> Self {
        Self {
            listen,
            target,
            listener: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Stream for TcpProxy {
    async fn setup(&self) -> Result<(), RouteError> {
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|source| RouteError::Listen {
                addr: self.listen.to_string(),
                source,
            })?;
        *self.listener.lock() = Some(Arc::new(listener));
        Ok(())
    }

    async fn accept(&self) -> io::Result<StreamConn> {
        let listener = self.listener.lock().clone().ok_or_else(not_set_up)?;
        let (stream, peer) = listener.accept().await?;
        Ok(StreamConn::Tcp { stream, peer })
    }

    async fn handle(&self, conn: StreamConn, cancel: CancellationToken) {
        let StreamConn::Tcp { mut stream, peer } = conn else {
            return;
        };

        let mut upstream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.target)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                warn!(target = %self.target, peer = %peer, error = %e, "Failed to connect upstream");
                return;
            }
            Err(_) => {
                warn!(target = %self.target, peer = %peer, "Upstream connect timed out");
                return;
            }
        };
        let _ = upstream.set_nodelay(true);

        tokio::select! {
            _ = cancel.cancelled() => {
                trace!(peer = %peer, "Connection cancelled");
            }
            result = copy_bidirectional(&mut stream, &mut upstream) => match result {
                Ok((up, down)) => trace!(peer = %peer, up, down, "Connection closed"),
                Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().and_then(|l| l.local_addr().ok())
    }

    fn close(&self) {
        self.listener.lock().take();
    }
}

/// UDP forwarder with one upstream socket per client address
pub struct UdpProxy {
    listen: SocketAddr,
    target: String,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    sessions: DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
    idle_timeout: Duration,
}

impl UdpProxy {
    pub fn new(listen: SocketAddr, target: String) -> Self {
        Self {
            listen,
            target,
            socket: Mutex::new(None),
            sessions: DashMap::new(),
            idle_timeout: UDP_SESSION_IDLE,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    async fn relay(
        &self,
        peer: SocketAddr,
        first: Vec<u8>,
        mut rx: mpsc::Receiver<Vec<u8>>,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        let bind: SocketAddr = if socket.local_addr()?.is_ipv6() {
            "[::]:0".parse().map_err(|_| not_set_up())?
        } else {
            "0.0.0.0:0".parse().map_err(|_| not_set_up())?
        };
        let upstream = UdpSocket::bind(bind).await?;
        upstream.connect(&self.target).await?;
        upstream.send(&first).await?;

        let mut buf = vec![0u8; UDP_MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.idle_timeout) => {
                    trace!(peer = %peer, "UDP session expired");
                    return Ok(());
                }
                datagram = rx.recv() => match datagram {
                    Some(data) => {
                        upstream.send(&data).await?;
                    }
                    None => return Ok(()),
                },
                received = upstream.recv(&mut buf) => {
                    let n = received?;
                    socket.send_to(&buf[..n], peer).await?;
                }
            }
        }
    }
}

#[async_trait]
impl Stream for UdpProxy {
    async fn setup(&self) -> Result<(), RouteError> {
        let socket = UdpSocket::bind(self.listen)
            .await
            .map_err(|source| RouteError::Listen {
                addr: self.listen.to_string(),
                source,
            })?;
        *self.socket.lock() = Some(Arc::new(socket));
        Ok(())
    }

    async fn accept(&self) -> io::Result<StreamConn> {
        let socket = self.socket.lock().clone().ok_or_else(not_set_up)?;
        let mut buf = vec![0u8; UDP_MAX_DATAGRAM];

        loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;
            let data = buf[..n].to_vec();

            let pending = match self.sessions.get(&peer) {
                Some(tx) => match tx.try_send(data) {
                    Ok(()) => None,
                    Err(TrySendError::Full(_)) => {
                        trace!(peer = %peer, "UDP session backlogged, dropping datagram");
                        None
                    }
                    Err(TrySendError::Closed(data)) => Some(data),
                },
                None => Some(data),
            };
            let Some(first) = pending else {
                continue;
            };

            let (tx, rx) = mpsc::channel(UDP_SESSION_BUFFER);
            self.sessions.insert(peer, tx);
            return Ok(StreamConn::Udp {
                peer,
                first,
                rx,
                socket,
            });
        }
    }

    async fn handle(&self, conn: StreamConn, cancel: CancellationToken) {
        let StreamConn::Udp {
            peer,
            first,
            rx,
            socket,
        } = conn
        else {
            return;
        };

        if let Err(e) = self.relay(peer, first, rx, socket, cancel).await {
            debug!(peer = %peer, target = %self.target, error = %e, "UDP session error");
        }
        // Our receiver is gone by now; a live sender belongs to a newer session.
        self.sessions.remove_if(&peer, |_, tx| tx.is_closed());
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    fn close(&self) {
        self.socket.lock().take();
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn tcp_echo() -> SocketAddr {
        let listener = TcpListener::bind(any_port()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut s, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind(any_port()).await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else { return };
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    fn serve(proxy: Arc<dyn Stream>, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = cancel.cancelled() => return,
                    conn = proxy.accept() => match conn {
                        Ok(conn) => conn,
                        Err(_) => return,
                    },
                };
                let proxy = Arc::clone(&proxy);
                let cancel = cancel.clone();
                tokio::spawn(async move { proxy.handle(conn, cancel).await });
            }
        });
    }

    #[tokio::test]
    async fn test_tcp_proxy_forwards_both_ways() {
        let backend = tcp_echo().await;
        let proxy = Arc::new(TcpProxy::new(any_port(), backend.to_string()));
        proxy.setup().await.unwrap();
        let addr = proxy.local_addr().unwrap();
        let cancel = CancellationToken::new();
        serve(proxy.clone(), cancel.clone());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_tcp_proxy_closes_client_when_upstream_down() {
        // Bind then drop to get a port nobody listens on.
        let dead = TcpListener::bind(any_port()).await.unwrap().local_addr().unwrap();
        let proxy = Arc::new(TcpProxy::new(any_port(), dead.to_string()));
        proxy.setup().await.unwrap();
        let addr = proxy.local_addr().unwrap();
        let cancel = CancellationToken::new();
        serve(proxy.clone(), cancel.clone());

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_setup_reports_listen_error() {
        let taken = TcpListener::bind(any_port()).await.unwrap();
        let proxy = TcpProxy::new(taken.local_addr().unwrap(), "127.0.0.1:1".into());
        assert!(matches!(proxy.setup().await, Err(RouteError::Listen { .. })));
    }

    #[tokio::test]
    async fn test_close_releases_listener() {
        let proxy = TcpProxy::new(any_port(), "127.0.0.1:1".into());
        proxy.setup().await.unwrap();
        let addr = proxy.local_addr().unwrap();
        proxy.close();

        assert!(proxy.local_addr().is_none());
        assert!(proxy.accept().await.is_err());
        TcpListener::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_proxy_keeps_peers_apart() {
        let backend = udp_echo().await;
        let proxy = Arc::new(UdpProxy::new(any_port(), backend.to_string()));
        proxy.setup().await.unwrap();
        let addr = proxy.local_addr().unwrap();
        let cancel = CancellationToken::new();
        serve(proxy.clone(), cancel.clone());

        let a = UdpSocket::bind(any_port()).await.unwrap();
        let b = UdpSocket::bind(any_port()).await.unwrap();
        let mut buf = [0u8; 16];

        for round in 0..3 {
            let msg_a = format!("a{}", round);
            let msg_b = format!("b{}", round);
            a.send_to(msg_a.as_bytes(), addr).await.unwrap();
            b.send_to(msg_b.as_bytes(), addr).await.unwrap();

            let n = tokio::time::timeout(Duration::from_secs(2), a.recv(&mut buf)).await.unwrap().unwrap();
            assert_eq!(&buf[..n], msg_a.as_bytes());
            let n = tokio::time::timeout(Duration::from_secs(2), b.recv(&mut buf)).await.unwrap().unwrap();
            assert_eq!(&buf[..n], msg_b.as_bytes());
        }

        assert_eq!(proxy.num_sessions(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_session_expires() {
        let backend = udp_echo().await;
        let proxy = Arc::new(
            UdpProxy::new(any_port(), backend.to_string()).with_idle_timeout(Duration::from_millis(100)),
        );
        proxy.setup().await.unwrap();
        let addr = proxy.local_addr().unwrap();
        let cancel = CancellationToken::new();
        serve(proxy.clone(), cancel.clone());

        let client = UdpSocket::bind(any_port()).await.unwrap();
        client.send_to(b"hi", addr).await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(proxy.num_sessions(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(proxy.num_sessions(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_ended_udp_session_keeps_its_replacement() {
        let backend = udp_echo().await;
        let proxy = UdpProxy::new(any_port(), backend.to_string());
        proxy.setup().await.unwrap();
        let socket = proxy.socket.lock().clone().unwrap();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let (old_tx, old_rx) = mpsc::channel(UDP_SESSION_BUFFER);
        proxy.sessions.insert(peer, old_tx);
        // A newer session for the same peer took over the entry
        let (new_tx, mut new_rx) = mpsc::channel(UDP_SESSION_BUFFER);
        proxy.sessions.insert(peer, new_tx);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let conn = StreamConn::Udp {
            peer,
            first: b"hi".to_vec(),
            rx: old_rx,
            socket,
        };
        proxy.handle(conn, cancel).await;

        assert_eq!(proxy.num_sessions(), 1);
        let tx = proxy.sessions.get(&peer).map(|tx| tx.clone()).unwrap();
        tx.try_send(b"still routed".to_vec()).unwrap();
        assert_eq!(new_rx.recv().await.unwrap(), b"still routed".to_vec());

        drop(tx);
        drop(new_rx);
        let (_, rx) = mpsc::channel(UDP_SESSION_BUFFER);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let socket = proxy.socket.lock().clone().unwrap();
        proxy
            .handle(
                StreamConn::Udp {
                    peer,
                    first: b"bye".to_vec(),
                    rx,
                    socket,
                },
                cancel,
            )
            .await;
        assert_eq!(proxy.num_sessions(), 0);
    }
}
