use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tonic::transport::server::Connected;
use tracing::{debug, warn};

use crate::auth::PeerIdentity;

/// Preamble byte identifying a consensus connection on the shared port.
///
/// Application clients must never send `0x00` or `0x01` as their first byte;
/// gRPC's connection preface never does.
pub const RAFT_RPC_TAG: u8 = 0x01;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("not a raft rpc")]
    NotARaftRpc,

    #[error("listener closed")]
    Closed,

    #[error("dial timed out")]
    DialTimeout,

    #[error("cannot derive a tls server name from {0:?}")]
    InvalidServerName(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Duplex byte stream, plain TCP or TLS-wrapped.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

/// Stream that replays one sniffed byte before the underlying connection.
pub struct PrefixedStream<S> {
    prefix: Option<u8>,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: u8, inner: S) -> PrefixedStream<S> {
        PrefixedStream {
            prefix: Some(prefix),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(byte) = self.prefix.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Application-lane connection handed to the gRPC server: plain TCP, or
/// TLS-terminated with the client certificate's identity attached.
pub struct MuxStream {
    io: BoxedConn,
    identity: PeerIdentity,
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl Connected for MuxStream {
    type ConnectInfo = PeerIdentity;

    fn connect_info(&self) -> PeerIdentity {
        self.identity.clone()
    }
}

/// Inbound consensus connections, consumed by [`StreamLayer::accept`].
pub struct RaftLane {
    rx: mpsc::Receiver<PrefixedStream<TcpStream>>,
}

/// Inbound application connections, consumable by tonic's
/// `serve_with_incoming`.
pub struct AppIncoming {
    rx: mpsc::Receiver<Result<MuxStream, io::Error>>,
}

impl tokio_stream::Stream for AppIncoming {
    type Item = Result<MuxStream, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Single-listener demultiplexer. Reads the first byte of every inbound
/// connection, replays it, and routes: [`RAFT_RPC_TAG`] to the raft lane,
/// anything else to the application lane. With a server TLS config, the
/// application lane is TLS-terminated here and each connection carries the
/// identity from its client certificate; the raft lane does its own TLS in
/// [`StreamLayer::accept`], after the plaintext preamble.
pub struct Mux {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Mux {
    pub async fn bind(
        addr: &str,
        app_tls: Option<Arc<ServerConfig>>,
    ) -> io::Result<(Mux, RaftLane, AppIncoming)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (raft_tx, raft_rx) = mpsc::channel(64);
        let (app_tx, app_rx) = mpsc::channel(64);
        let acceptor = app_tls.map(TlsAcceptor::from);
        let accept_task = tokio::spawn(accept_loop(listener, acceptor, raft_tx, app_tx));

        Ok((
            Mux {
                local_addr,
                accept_task,
            },
            RaftLane { rx: raft_rx },
            AppIncoming { rx: app_rx },
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    app_tls: Option<TlsAcceptor>,
    raft_tx: mpsc::Sender<PrefixedStream<TcpStream>>,
    app_tx: mpsc::Sender<Result<MuxStream, io::Error>>,
) {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let app_tls = app_tls.clone();
        let raft_tx = raft_tx.clone();
        let app_tx = app_tx.clone();
        tokio::spawn(async move {
            let mut conn = conn;
            let first = match tokio::time::timeout(Duration::from_secs(10), conn.read_u8()).await
            {
                Ok(Ok(byte)) => byte,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "connection closed before preamble");
                    return;
                }
                Err(_) => {
                    debug!(%peer, "connection sent no preamble byte");
                    return;
                }
            };

            let stream = PrefixedStream::new(first, conn);
            if first == RAFT_RPC_TAG {
                let _ = raft_tx.send(stream).await;
                return;
            }

            let mux_stream = match &app_tls {
                None => MuxStream {
                    io: Box::new(stream),
                    identity: PeerIdentity::default(),
                },
                // the replayed byte is the start of the client hello, so
                // the handshake sees the whole record
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => {
                        let identity = client_identity(tls.get_ref().1);
                        MuxStream {
                            io: Box::new(tls),
                            identity,
                        }
                    }
                    Err(e) => {
                        debug!(%peer, error = %e, "app tls handshake failed");
                        return;
                    }
                },
            };
            let _ = app_tx.send(Ok(mux_stream)).await;
        });
    }
}

fn client_identity(conn: &tokio_rustls::rustls::ServerConnection) -> PeerIdentity {
    conn.peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| PeerIdentity::from_client_cert(cert.as_ref()))
        .unwrap_or_default()
}

/// Consensus transport sharing the mux's port.
///
/// Dialing writes the raft preamble byte and optionally wraps the
/// connection as a TLS client; accepting consumes the replayed preamble,
/// rejects anything that is not a raft connection, and optionally wraps as
/// a TLS server. TLS material is prepared by the caller.
pub struct StreamLayer {
    raft_lane: tokio::sync::Mutex<RaftLane>,
    local_addr: SocketAddr,
    server_tls: Option<TlsAcceptor>,
    peer_tls: Option<TlsConnector>,
}

impl StreamLayer {
    pub fn new(
        raft_lane: RaftLane,
        local_addr: SocketAddr,
        server_tls: Option<Arc<ServerConfig>>,
        peer_tls: Option<Arc<ClientConfig>>,
    ) -> StreamLayer {
        StreamLayer {
            raft_lane: tokio::sync::Mutex::new(raft_lane),
            local_addr,
            server_tls: server_tls.map(TlsAcceptor::from),
            peer_tls: peer_tls.map(TlsConnector::from),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connects to a peer's stream layer and identifies the connection as
    /// consensus traffic.
    pub async fn dial(&self, addr: &str, timeout: Duration) -> Result<BoxedConn, StreamError> {
        let mut conn = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| StreamError::DialTimeout)??;

        conn.write_all(&[RAFT_RPC_TAG]).await?;

        match &self.peer_tls {
            None => Ok(Box::new(conn)),
            Some(connector) => {
                let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
                let name = ServerName::try_from(host.to_string())
                    .map_err(|_| StreamError::InvalidServerName(host.to_string()))?;
                Ok(Box::new(connector.connect(name, conn).await?))
            }
        }
    }

    /// Yields the next inbound consensus connection.
    pub async fn accept(&self) -> Result<BoxedConn, StreamError> {
        let mut conn = {
            let mut lane = self.raft_lane.lock().await;
            lane.rx.recv().await.ok_or(StreamError::Closed)?
        };

        let tag = conn.read_u8().await?;
        if tag != RAFT_RPC_TAG {
            return Err(StreamError::NotARaftRpc);
        }

        match &self.server_tls {
            None => Ok(Box::new(conn)),
            Some(acceptor) => Ok(Box::new(acceptor.accept(conn).await?)),
        }
    }
}
