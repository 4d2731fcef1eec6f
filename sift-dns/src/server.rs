//! UDP and TCP listeners
//!
//! Both transports bind the same address and share one resolver. Each UDP
//! datagram and each TCP connection is handled in its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::resolver::Resolver;

/// Maximum DNS message size accepted over UDP.
const MAX_UDP_MESSAGE_SIZE: usize = 4096;

/// DNS server: one UDP and one TCP accept path sharing a resolver.
pub struct DnsServer {
    bind_addr: SocketAddr,
    resolver: Arc<Resolver>,
    shutdown: broadcast::Sender<()>,
}

impl DnsServer {
    pub fn new(
        bind_addr: SocketAddr,
        resolver: Arc<Resolver>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            bind_addr,
            resolver,
            shutdown,
        }
    }

    /// Bind both transports and serve until the shutdown signal fires.
    pub async fn run(self) -> Result<()> {
        let udp = UdpSocket::bind(self.bind_addr).await.map_err(|e| {
            Error::Dns(format!(
                "failed to bind UDP listener on {}: {}",
                self.bind_addr, e
            ))
        })?;
        let tcp = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            Error::Dns(format!(
                "failed to bind TCP listener on {}: {}",
                self.bind_addr, e
            ))
        })?;
        info!(addr = %self.bind_addr, "DNS server listening");

        let udp_task = tokio::spawn(run_udp(
            Arc::new(udp),
            self.resolver.clone(),
            self.shutdown.subscribe(),
        ));
        let tcp_task = tokio::spawn(run_tcp(
            tcp,
            self.resolver.clone(),
            self.shutdown.subscribe(),
        ));

        let _ = tokio::join!(udp_task, tcp_task);
        Ok(())
    }
}

async fn run_udp(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("UDP listener shutting down");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, peer)) => {
                        let query = buf[..len].to_vec();
                        let socket = socket.clone();
                        let resolver = resolver.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = resolver.resolve(&query, Some(peer.ip())).await {
                                if let Err(e) = socket.send_to(&reply, peer).await {
                                    error!(peer = %peer, error = %e, "failed to send UDP reply");
                                }
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "UDP recv error"),
                }
            }
        }
    }
}

async fn run_tcp(
    listener: TcpListener,
    resolver: Arc<Resolver>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("TCP listener shutting down");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let resolver = resolver.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_tcp_connection(stream, peer, resolver).await {
                                debug!(peer = %peer, error = %e, "TCP connection ended");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "TCP accept error"),
                }
            }
        }
    }
}

/// Serve length-prefixed DNS messages on one client connection until the
/// peer closes it.
async fn serve_tcp_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            // Normal end of connection.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        if let Some(reply) = resolver.resolve(&query, Some(peer.ip())).await {
            let mut framed = Vec::with_capacity(2 + reply.len());
            framed.extend_from_slice(&(reply.len() as u16).to_be_bytes());
            framed.extend_from_slice(&reply);
            stream.write_all(&framed).await?;
        }
    }
}
