use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::{Error, Result};

/// The medium a channel runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Media {
    UdpUnicast,
    UdpMulticast,
    Ipc,
}

/// Parsed channel URI.
///
/// Format: `media:kind?param=value|param=value`
///
/// - `udp:unicast?endpoint=host:port` — point-to-point UDP
/// - `udp:multicast?endpoint=group:port|interface=addr|ttl=n` — multicast UDP
/// - `ipc:name` — intra-host shared memory, `name` identifies the channel
///
/// Common parameters: `term-length=bytes` overrides the driver default term
/// length for streams on this channel. Unknown parameters are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelUri {
    media: Media,
    /// Endpoint string for UDP media, channel name for IPC.
    endpoint: String,
    interface: Option<Ipv4Addr>,
    ttl: Option<u8>,
    term_length: Option<usize>,
}

impl ChannelUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| Error::InvalidChannel(format!("missing media scheme: {uri}")))?;

        let (kind, params) = match rest.split_once('?') {
            Some((kind, params)) => (kind, Some(params)),
            None => (rest, None),
        };

        match scheme {
            "udp" => Self::parse_udp(kind, params),
            "ipc" => Self::parse_ipc(kind, params),
            other => Err(Error::InvalidChannel(format!("unknown media: {other}"))),
        }
    }

    fn parse_udp(kind: &str, params: Option<&str>) -> Result<Self> {
        if kind != "unicast" && kind != "multicast" {
            return Err(Error::InvalidChannel(format!("unknown udp kind: {kind}")));
        }
        let mut endpoint = None;
        let mut interface = None;
        let mut ttl = None;
        let mut term_length = None;
        for (key, value) in split_params(params)? {
            match key {
                "endpoint" => endpoint = Some(value.to_string()),
                "interface" => {
                    let addr: Ipv4Addr = value.parse().map_err(|_| {
                        Error::InvalidChannel(format!("invalid interface: {value}"))
                    })?;
                    interface = Some(addr);
                }
                "ttl" => {
                    let parsed: u8 = value
                        .parse()
                        .map_err(|_| Error::InvalidChannel(format!("invalid ttl: {value}")))?;
                    ttl = Some(parsed);
                }
                "term-length" => term_length = Some(parse_term_length(value)?),
                other => {
                    return Err(Error::InvalidChannel(format!("unknown parameter: {other}")))
                }
            }
        }
        let endpoint = endpoint
            .ok_or_else(|| Error::InvalidChannel("udp channel requires endpoint".to_string()))?;
        let addr = resolve_endpoint(&endpoint)?;
        let is_multicast = addr.ip().is_multicast();
        let media = match kind {
            "multicast" if is_multicast => Media::UdpMulticast,
            "multicast" => {
                return Err(Error::InvalidChannel(format!(
                    "multicast channel with non-multicast endpoint: {endpoint}"
                )))
            }
            "unicast" if is_multicast => {
                return Err(Error::InvalidChannel(format!(
                    "unicast channel with multicast endpoint: {endpoint}"
                )))
            }
            _ => Media::UdpUnicast,
        };
        if media == Media::UdpUnicast && ttl.is_some() {
            return Err(Error::InvalidChannel(
                "ttl is only valid on multicast channels".to_string(),
            ));
        }
        Ok(Self {
            media,
            endpoint,
            interface,
            ttl,
            term_length,
        })
    }

    fn parse_ipc(name: &str, params: Option<&str>) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidChannel("ipc channel requires a name".to_string()));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(Error::InvalidChannel(format!("invalid ipc channel name: {name}")));
        }
        let mut term_length = None;
        for (key, value) in split_params(params)? {
            match key {
                "term-length" => term_length = Some(parse_term_length(value)?),
                other => {
                    return Err(Error::InvalidChannel(format!("unknown parameter: {other}")))
                }
            }
        }
        Ok(Self {
            media: Media::Ipc,
            endpoint: name.to_string(),
            interface: None,
            ttl: None,
            term_length,
        })
    }

    pub fn media(&self) -> Media {
        self.media
    }

    pub fn is_ipc(&self) -> bool {
        self.media == Media::Ipc
    }

    pub fn is_multicast(&self) -> bool {
        self.media == Media::UdpMulticast
    }

    /// Channel name for IPC media.
    pub fn name(&self) -> &str {
        &self.endpoint
    }

    /// Resolved socket address for UDP media.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        if self.media == Media::Ipc {
            return Err(Error::InvalidChannel("ipc channel has no socket address".to_string()));
        }
        resolve_endpoint(&self.endpoint)
    }

    pub fn interface(&self) -> Option<Ipv4Addr> {
        self.interface
    }

    pub fn ttl(&self) -> Option<u8> {
        self.ttl
    }

    pub fn term_length(&self) -> Option<usize> {
        self.term_length
    }

    /// Stable key used by the driver to unify registrations on the same channel.
    ///
    /// Omits tuning parameters (term-length, ttl) so that two URIs naming the
    /// same endpoint resolve to the same stream space.
    pub fn canonical(&self) -> String {
        match self.media {
            Media::UdpUnicast => format!("udp:unicast?endpoint={}", self.endpoint),
            Media::UdpMulticast => format!("udp:multicast?endpoint={}", self.endpoint),
            Media::Ipc => format!("ipc:{}", self.endpoint),
        }
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn split_params(params: Option<&str>) -> Result<Vec<(&str, &str)>> {
    let mut out = Vec::new();
    let Some(params) = params else {
        return Ok(out);
    };
    for piece in params.split('|') {
        if piece.is_empty() {
            continue;
        }
        let (key, value) = piece
            .split_once('=')
            .ok_or_else(|| Error::InvalidChannel(format!("malformed parameter: {piece}")))?;
        out.push((key, value));
    }
    Ok(out)
}

fn parse_term_length(value: &str) -> Result<usize> {
    let parsed: usize = value
        .parse()
        .map_err(|_| Error::InvalidChannel(format!("invalid term-length: {value}")))?;
    Ok(parsed)
}

fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    // Fast path for literal addresses, DNS fallback for names.
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }
    endpoint
        .to_socket_addrs()
        .map_err(|_| Error::InvalidChannel(format!("unresolvable endpoint: {endpoint}")))?
        .find(|addr| matches!(addr.ip(), IpAddr::V4(_)))
        .ok_or_else(|| Error::InvalidChannel(format!("no ipv4 address for endpoint: {endpoint}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unicast() {
        let uri = ChannelUri::parse("udp:unicast?endpoint=127.0.0.1:40123").unwrap();
        assert_eq!(uri.media(), Media::UdpUnicast);
        assert_eq!(
            uri.socket_addr().unwrap(),
            "127.0.0.1:40123".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn parses_multicast_with_params() {
        let uri =
            ChannelUri::parse("udp:multicast?endpoint=224.0.1.1:40456|interface=127.0.0.1|ttl=4")
                .unwrap();
        assert_eq!(uri.media(), Media::UdpMulticast);
        assert_eq!(uri.ttl(), Some(4));
        assert_eq!(uri.interface(), Some(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn parses_ipc_with_term_length() {
        let uri = ChannelUri::parse("ipc:market_data?term-length=65536").unwrap();
        assert!(uri.is_ipc());
        assert_eq!(uri.name(), "market_data");
        assert_eq!(uri.term_length(), Some(65536));
    }

    #[test]
    fn rejects_unknown_parameter() {
        assert!(matches!(
            ChannelUri::parse("udp:unicast?endpoint=127.0.0.1:1|bogus=1"),
            Err(Error::InvalidChannel(_))
        ));
    }

    #[test]
    fn rejects_media_kind_mismatch() {
        assert!(ChannelUri::parse("udp:unicast?endpoint=224.0.1.1:40456").is_err());
        assert!(ChannelUri::parse("udp:multicast?endpoint=127.0.0.1:40456").is_err());
    }

    #[test]
    fn rejects_missing_endpoint() {
        assert!(ChannelUri::parse("udp:unicast").is_err());
    }

    #[test]
    fn rejects_bad_ipc_name() {
        assert!(ChannelUri::parse("ipc:no/slashes").is_err());
        assert!(ChannelUri::parse("ipc:").is_err());
    }

    #[test]
    fn canonical_strips_tuning_params() {
        let a = ChannelUri::parse("ipc:orders?term-length=65536").unwrap();
        let b = ChannelUri::parse("ipc:orders").unwrap();
        assert_eq!(a.canonical(), b.canonical());
    }
}
