//! UDP transport behind the [`UdpTransport`] seam.
//!
//! The production implementation owns a broadcast-capable socket built
//! with `socket2` and classifies IO failures as transient (receive loop
//! resumes) or fatal (server stops).

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::Config;
use crate::error::{Error, Result};

const RECV_BUFFER_SIZE: usize = 1500;

/// Linux errno for a datagram exceeding the buffer.
#[cfg(unix)]
const EMSGSIZE: i32 = 90;

pub trait UdpTransport: Send + Sync + 'static {
    fn local_endpoint(&self) -> SocketAddrV4;
    fn receive(&self) -> impl Future<Output = Result<(SocketAddr, Vec<u8>)>> + Send;
    fn send(&self, peer: SocketAddr, data: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

pub struct UdpSocketTransport {
    socket: UdpSocket,
    endpoint: SocketAddrV4,
}

impl UdpSocketTransport {
    /// Binds 0.0.0.0 on the configured port with SO_REUSEADDR and
    /// SO_BROADCAST, optionally pinned to one device on Linux.
    pub fn bind(config: &Config) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("failed to set non-blocking: {}", error)))?;

        if let Some(interface) = &config.interface {
            #[cfg(target_os = "linux")]
            socket
                .bind_device(Some(interface.as_bytes()))
                .map_err(|error| {
                    Error::Socket(format!("failed to bind to device {}: {}", interface, error))
                })?;

            #[cfg(not(target_os = "linux"))]
            tracing::warn!(
                interface = %interface,
                "interface binding is only supported on Linux and will be ignored"
            );
        }

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket
            .bind(&bind_addr.into())
            .map_err(|error| Error::Socket(format!("failed to bind {}: {}", bind_addr, error)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|error| Error::Socket(format!("failed to register socket: {}", error)))?;

        Ok(Self {
            socket,
            endpoint: config.endpoint(),
        })
    }
}

impl UdpTransport for UdpSocketTransport {
    fn local_endpoint(&self) -> SocketAddrV4 {
        self.endpoint
    }

    async fn receive(&self) -> Result<(SocketAddr, Vec<u8>)> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        match self.socket.recv_from(&mut buffer).await {
            Ok((size, peer)) => Ok((peer, buffer[..size].to_vec())),
            Err(error) => Err(classify(error)),
        }
    }

    async fn send(&self, peer: SocketAddr, data: &[u8]) -> Result<()> {
        self.socket
            .send_to(data, peer)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Oversize datagrams and ICMP-induced connection resets are routine on a
/// DHCP socket; everything else means the socket is broken.
fn classify(error: io::Error) -> Error {
    Error::Transport {
        fatal: !is_transient(&error),
        source: error,
    }
}

fn is_transient(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    ) {
        return true;
    }
    #[cfg(unix)]
    if error.raw_os_error() == Some(EMSGSIZE) {
        return true;
    }
    false
}
