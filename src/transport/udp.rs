use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::ChannelUri;
use crate::{Error, Result};

/// Socket tuning applied to every UDP endpoint the driver opens.
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    /// SO_SNDBUF, 0 keeps the OS default.
    pub send_buffer: usize,
    /// SO_RCVBUF, 0 keeps the OS default.
    pub recv_buffer: usize,
    /// Default multicast TTL when the channel URI does not carry one.
    pub multicast_ttl: u8,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_buffer: 0,
            recv_buffer: 0,
            multicast_ttl: 1,
        }
    }
}

/// A non-blocking UDP endpoint for one channel.
///
/// Send endpoints bind an ephemeral port and address the channel endpoint;
/// receive endpoints bind the channel endpoint's port (joining the group for
/// multicast). Both directions poll the same socket, since flow-control and
/// NAK frames travel opposite to the data they refer to.
pub struct UdpChannel {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl UdpChannel {
    /// Endpoint for the sending side of a channel.
    pub fn sender(uri: &ChannelUri, config: &SocketConfig) -> Result<Self> {
        let dest = uri.socket_addr()?;
        let socket = new_socket(config)?;
        let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("literal address");
        socket.bind(&bind_addr.into())?;
        if uri.is_multicast() {
            let interface = uri.interface().unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.set_multicast_if_v4(&interface)?;
        }
        let socket: UdpSocket = socket.into();
        if uri.is_multicast() {
            socket.set_multicast_ttl_v4(uri.ttl().unwrap_or(config.multicast_ttl) as u32)?;
            socket.set_multicast_loop_v4(true)?;
        }
        socket.set_nonblocking(true)?;
        Ok(Self { socket, dest })
    }

    /// Endpoint for the receiving side of a channel.
    pub fn receiver(uri: &ChannelUri, config: &SocketConfig) -> Result<Self> {
        let endpoint = uri.socket_addr()?;
        let socket = new_socket(config)?;
        socket.set_reuse_address(true)?;
        if uri.is_multicast() {
            // Bind the port on the wildcard address, then join the group on
            // the configured interface.
            let bind_addr: SocketAddr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), endpoint.port());
            socket.bind(&bind_addr.into())?;
            let socket: UdpSocket = socket.into();
            let group = match endpoint {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => {
                    return Err(Error::InvalidChannel("ipv6 multicast not supported".to_string()))
                }
            };
            let interface = uri.interface().unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(&group, &interface)?;
            socket.set_multicast_loop_v4(true)?;
            socket.set_nonblocking(true)?;
            Ok(Self {
                socket,
                dest: endpoint,
            })
        } else {
            socket.bind(&endpoint.into())?;
            let socket: UdpSocket = socket.into();
            socket.set_nonblocking(true)?;
            Ok(Self {
                socket,
                dest: endpoint,
            })
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The channel endpoint this side addresses by default.
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Send to the channel endpoint. A full socket buffer drops the datagram,
    /// which is indistinguishable from network loss and recovered the same
    /// way (NAK and retransmit).
    pub fn send(&self, buf: &[u8]) -> Result<()> {
        self.send_to(buf, self.dest)
    }

    pub fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<()> {
        match self.socket.send_to(buf, dest) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Non-blocking receive. `None` when nothing is pending.
    pub fn poll(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

fn new_socket(config: &SocketConfig) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if config.send_buffer > 0 {
        socket.set_send_buffer_size(config.send_buffer)?;
    }
    if config.recv_buffer > 0 {
        socket.set_recv_buffer_size(config.recv_buffer)?;
    }
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelUri;
    use std::time::{Duration, Instant};

    fn free_port() -> u16 {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    fn poll_until(channel: &UdpChannel, buf: &mut [u8]) -> (usize, SocketAddr) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(received) = channel.poll(buf).unwrap() {
                return received;
            }
            assert!(Instant::now() < deadline, "timed out waiting for datagram");
            std::thread::yield_now();
        }
    }

    #[test]
    fn unicast_loopback_round_trip() {
        let port = free_port();
        let uri = ChannelUri::parse(&format!("udp:unicast?endpoint=127.0.0.1:{port}")).unwrap();
        let rx = UdpChannel::receiver(&uri, &SocketConfig::default()).unwrap();
        let tx = UdpChannel::sender(&uri, &SocketConfig::default()).unwrap();

        tx.send(b"ping").unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = poll_until(&rx, &mut buf);
        assert_eq!(&buf[..len], b"ping");

        // Reply to the sender's source address.
        rx.send_to(b"pong", from).unwrap();
        let (len, _) = poll_until(&tx, &mut buf);
        assert_eq!(&buf[..len], b"pong");
    }

    #[test]
    fn poll_on_idle_socket_returns_none() {
        let port = free_port();
        let uri = ChannelUri::parse(&format!("udp:unicast?endpoint=127.0.0.1:{port}")).unwrap();
        let rx = UdpChannel::receiver(&uri, &SocketConfig::default()).unwrap();
        let mut buf = [0u8; 64];
        assert!(rx.poll(&mut buf).unwrap().is_none());
    }
}
