//! Decomposition of endpoint strings such as `https://host:443/path?query`.
//!
//! These helpers only slice the input; they never allocate. Host and path lookups are bounded
//! by a caller supplied capacity and report overflow instead of truncating.

use thiserror::Error;

pub const HOST_CAPACITY: usize = 64;
pub const PATH_CAPACITY: usize = 192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Secure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl Transport {
    pub fn default_port(self, kind: SocketKind) -> u16 {
        match (self, kind) {
            (Transport::Secure, SocketKind::Stream) => 443,
            (Transport::Plain, SocketKind::Stream) => 80,
            (Transport::Secure, SocketKind::Datagram) => 5684,
            (Transport::Plain, SocketKind::Datagram) => 5683,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("no host in {0:?}")]
    MissingHost(String),

    #[error("{part} of {needed} bytes does not fit in {capacity} bytes")]
    Truncated {
        part: &'static str,
        needed: usize,
        capacity: usize,
    },
}

fn split_scheme(url: &str) -> (Option<&str>, &str) {
    match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    }
}

fn authority(url: &str) -> &str {
    let (_, rest) = split_scheme(url);
    rest.split_once('/').map_or(rest, |(authority, _)| authority)
}

/// Splits an authority into host and optional port text, honouring `[v6]:port` literals.
fn split_port(authority: &str) -> (&str, Option<&str>) {
    if let Some(bracketed) = authority.strip_prefix('[') {
        return match bracketed.split_once(']') {
            Some((host, rest)) => (host, rest.strip_prefix(':')),
            None => (authority, None),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    }
}

pub fn parse_protocol(url: &str) -> Option<(Transport, SocketKind)> {
    let (scheme, _) = split_scheme(url);
    match scheme?.to_ascii_lowercase().as_str() {
        "http" => Some((Transport::Plain, SocketKind::Stream)),
        "https" => Some((Transport::Secure, SocketKind::Stream)),
        "coap" => Some((Transport::Plain, SocketKind::Datagram)),
        "coaps" => Some((Transport::Secure, SocketKind::Datagram)),
        _ => None,
    }
}

/// Protocol assumed for a URL without a recognised scheme.
pub fn default_protocol(has_trust_material: bool) -> (Transport, SocketKind) {
    if has_trust_material {
        (Transport::Secure, SocketKind::Stream)
    } else {
        (Transport::Plain, SocketKind::Stream)
    }
}

pub fn parse_port(url: &str) -> Option<u16> {
    let (_, port) = split_port(authority(url));
    port?.parse().ok()
}

pub fn parse_host(url: &str, capacity: usize) -> Result<&str, UriError> {
    let (host, _) = split_port(authority(url));
    if host.is_empty() {
        return Err(UriError::MissingHost(url.to_string()));
    }
    if host.len() > capacity {
        return Err(UriError::Truncated {
            part: "host",
            needed: host.len(),
            capacity,
        });
    }
    Ok(host)
}

/// Returns the resource path without its leading slash; the query string is kept.
pub fn parse_path(url: &str, capacity: usize) -> Result<&str, UriError> {
    let (_, rest) = split_scheme(url);
    let path = rest.split_once('/').map_or("", |(_, path)| path);
    if path.len() > capacity {
        return Err(UriError::Truncated {
            part: "path",
            needed: path.len(),
            capacity,
        });
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_scheme_and_port() {
        assert_eq!(
            parse_protocol("https://www.speedtest.net:8443/config.php"),
            Some((Transport::Secure, SocketKind::Stream))
        );
        assert_eq!(parse_port("https://www.speedtest.net:8443/config.php"), Some(8443));
        assert_eq!(
            parse_protocol("http://speed.example.com/upload.php"),
            Some((Transport::Plain, SocketKind::Stream))
        );
        assert_eq!(
            parse_protocol("coaps://sensor.example.com"),
            Some((Transport::Secure, SocketKind::Datagram))
        );
        assert_eq!(
            parse_protocol("COAP://sensor.example.com"),
            Some((Transport::Plain, SocketKind::Datagram))
        );
    }

    #[test]
    fn missing_scheme_and_port() {
        assert_eq!(parse_protocol("www.speedtest.net/config.php"), None);
        assert_eq!(parse_protocol("ftp://files.example.com"), None);
        assert_eq!(parse_port("www.speedtest.net/config.php"), None);
        assert_eq!(parse_port("https://www.speedtest.net/a:b"), None);
    }

    #[test]
    fn defaults_follow_trust_material() {
        let (transport, kind) = default_protocol(true);
        assert_eq!((transport, kind), (Transport::Secure, SocketKind::Stream));
        assert_eq!(transport.default_port(kind), 443);

        let (transport, kind) = default_protocol(false);
        assert_eq!((transport, kind), (Transport::Plain, SocketKind::Stream));
        assert_eq!(transport.default_port(kind), 80);

        assert_eq!(Transport::Secure.default_port(SocketKind::Datagram), 5684);
        assert_eq!(Transport::Plain.default_port(SocketKind::Datagram), 5683);
    }

    #[test]
    fn host() {
        assert_eq!(
            parse_host("https://www.speedtest.net:443/x", HOST_CAPACITY),
            Ok("www.speedtest.net")
        );
        assert_eq!(parse_host("speed.example.com/upload.php", HOST_CAPACITY), Ok("speed.example.com"));
        assert_eq!(parse_host("http://[::1]:8080/x", HOST_CAPACITY), Ok("::1"));
        assert_eq!(parse_port("http://[::1]:8080/x"), Some(8080));
        assert_eq!(parse_port("http://[::1]/x"), None);
    }

    #[test]
    fn host_overflow_is_reported() {
        assert_eq!(
            parse_host("http://a-rather-long-host.example.com/", 8),
            Err(UriError::Truncated {
                part: "host",
                needed: 30,
                capacity: 8
            })
        );
        assert!(matches!(
            parse_host("http:///path", HOST_CAPACITY),
            Err(UriError::MissingHost(_))
        ));
    }

    #[test]
    fn path() {
        assert_eq!(
            parse_path("https://www.speedtest.net/speedtest-servers-static.php?", PATH_CAPACITY),
            Ok("speedtest-servers-static.php?")
        );
        assert_eq!(
            parse_path("http://host:8080/speedtest/random3500x3500.jpg", PATH_CAPACITY),
            Ok("speedtest/random3500x3500.jpg")
        );
        assert_eq!(parse_path("http://host", PATH_CAPACITY), Ok(""));
        assert_eq!(
            parse_path("http://host/0123456789", 4),
            Err(UriError::Truncated {
                part: "path",
                needed: 10,
                capacity: 4
            })
        );
    }
}
