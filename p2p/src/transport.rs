//! Dial and accept primitives.
//!
//! The rest of the crate only needs something that turns a [`Multiaddr`] into a duplex byte stream ([`Dialer`]) and
//! something that hands out inbound duplex streams ([`Listener`]). TCP is the only transport provided here.

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use log::*;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Produces outbound duplex streams.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn dial(&self, addr: &Multiaddr) -> io::Result<Self::Stream>;
}

/// Produces inbound duplex streams.
#[async_trait]
pub trait Listener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, addr: &Multiaddr) -> io::Result<TcpStream> {
        let socket_addr = multiaddr_to_socket_addr(addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("not an ip/tcp address: {addr}")))?;
        let stream = TcpStream::connect(socket_addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Extracts the socket address from `/ip4|ip6/<ip>/tcp/<port>`, ignoring any trailing `/p2p/<id>`.
pub fn multiaddr_to_socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut iter = addr.iter();
    let ip: IpAddr = match iter.next()? {
        Protocol::Ip4(ip) => ip.into(),
        Protocol::Ip6(ip) => ip.into(),
        _ => return None,
    };
    let port = match iter.next()? {
        Protocol::Tcp(port) => port,
        _ => return None,
    };
    match iter.next() {
        None | Some(Protocol::P2p(_)) => Some(SocketAddr::new(ip, port)),
        Some(_) => None,
    }
}

pub fn socket_addr_to_multiaddr(addr: SocketAddr) -> Multiaddr {
    Multiaddr::empty().with(addr.ip().into()).with(Protocol::Tcp(addr.port()))
}

/// The addresses other hosts can reach a listener bound to `bound` on.
///
/// A concrete address is kept unless it is loopback. An unspecified one stands for every interface, so it expands to
/// the addresses of the same family on each interface that is up, paired with the bound port.
pub fn reachable_addrs(bound: SocketAddr) -> Vec<Multiaddr> {
    if bound.ip().is_unspecified() {
        expand_unspecified(bound, interface_ips())
    } else if advertisable(&bound.ip()) {
        vec![socket_addr_to_multiaddr(bound)]
    } else {
        Vec::new()
    }
}

fn interface_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();
    for iface in netdev::get_interfaces() {
        if !iface.is_up() {
            trace!("Skipping down interface {}", iface.name);
            continue;
        }
        ips.extend(iface.ipv4.iter().map(|net| IpAddr::V4(net.addr())));
        ips.extend(iface.ipv6.iter().map(|net| IpAddr::V6(net.addr())));
    }
    ips
}

fn expand_unspecified<I: IntoIterator<Item = IpAddr>>(bound: SocketAddr, ips: I) -> Vec<Multiaddr> {
    let mut addrs = Vec::new();
    for ip in ips {
        if ip.is_ipv4() != bound.is_ipv4() || !advertisable(&ip) {
            continue;
        }
        let addr = socket_addr_to_multiaddr(SocketAddr::new(ip, bound.port()));
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    if addrs.is_empty() {
        debug!("No non-loopback interface addresses found for {bound}");
    }
    addrs
}

/// Loopback and link-local addresses are useless to a remote peer.
fn advertisable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => !(ip.is_loopback() || ip.is_unspecified() || ip.is_link_local()),
        IpAddr::V6(ip) => !(ip.is_loopback() || ip.is_unspecified() || ip.is_unicast_link_local()),
    }
}

/// Drops a trailing `/p2p/<id>` component, if there is one.
pub fn strip_peer_id(mut addr: Multiaddr) -> Multiaddr {
    if let Some(Protocol::P2p(_)) = addr.iter().last() {
        addr.pop();
    }
    addr
}
