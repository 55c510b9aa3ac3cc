use std::io;
use std::net::SocketAddr;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, lookup_host};

use crate::error::{Error, Result};
use crate::transfer::TransferConfig;
use crate::transfer::tls;
use crate::uri::{self, HOST_CAPACITY, SocketKind, Transport};

/// Longest interface name accepted by `SO_BINDTODEVICE`, terminator excluded.
const MAX_NETWORK_NAME: usize = 15;

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Where and how a transfer connects, derived once from the URL given to `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub kind: SocketKind,
}

impl Endpoint {
    pub fn parse(url: &str, config: &TransferConfig) -> Result<Self> {
        let (transport, kind) = uri::parse_protocol(url).unwrap_or_else(|| {
            debug!("protocol not specified in {url:?}, defaulting to HTTP(S)");
            uri::default_protocol(!config.trust.is_empty())
        });
        let port = uri::parse_port(url).unwrap_or_else(|| transport.default_port(kind));
        let host = uri::parse_host(url, HOST_CAPACITY)?.to_string();
        Ok(Self {
            host,
            port,
            transport,
            kind,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.transport == Transport::Secure
    }

    fn connect_failed(&self, source: io::Error) -> Error {
        Error::ConnectFailed {
            host: self.host.clone(),
            source,
        }
    }
}

/// Opens a stream to the endpoint. Every check that needs no network I/O runs first, and a
/// socket that fails half way is dropped (closed) before returning.
pub async fn connect(endpoint: &Endpoint, config: &TransferConfig) -> Result<Box<dyn Stream>> {
    if endpoint.kind == SocketKind::Datagram {
        return Err(endpoint.connect_failed(io::Error::new(
            io::ErrorKind::Unsupported,
            "datagram transports are not supported",
        )));
    }
    if let Some(network) = &config.access_network {
        if network.len() > MAX_NETWORK_NAME {
            return Err(Error::InvalidConfig(format!(
                "access network name {network:?} is too long"
            )));
        }
    }
    let tls = if endpoint.is_secure() {
        Some((
            tls::connector(&config.trust, config.verify)?,
            tls::server_name(&endpoint.host)?,
        ))
    } else {
        None
    };

    let addr = resolve(&endpoint.host, endpoint.port, config.prefer_ipv6).await?;
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|err| endpoint.connect_failed(err))?;
    if let Some(network) = &config.access_network {
        bind_to_network(&socket, network).map_err(|err| endpoint.connect_failed(err))?;
    }

    info!("connecting to {}:{} ({})", endpoint.host, endpoint.port, addr);
    let stream = socket
        .connect(addr)
        .await
        .map_err(|err| endpoint.connect_failed(err))?;

    match tls {
        Some((connector, server_name)) => {
            let stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|err| endpoint.connect_failed(err))?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(stream)),
    }
}

async fn resolve(host: &str, port: u16, prefer_ipv6: bool) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|err| {
            debug!("failed to resolve {host}: {err}");
            Error::UnreachableHost(host.to_string())
        })?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv6() == prefer_ipv6)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::UnreachableHost(host.to_string()))
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_to_network(socket: &TcpSocket, network: &str) -> io::Result<()> {
    socket.bind_device(Some(network.as_bytes()))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_to_network(_socket: &TcpSocket, _network: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "binding to an access network is not supported on this platform",
    ))
}
