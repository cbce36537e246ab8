//! Control port address parsing.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::str::FromStr;

use url::Url;

/// Control port used when none is configured
pub const DEFAULT_CONTROL_PORT: &str = "tcp://127.0.0.1:9051";

/// Error returned for an unusable control port string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointError(String);

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid control port: {}", self.0)
    }
}

impl std::error::Error for EndpointError {}

/// Where the daemon's control port listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEndpoint {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for ControlEndpoint {
    type Err = EndpointError;

    /// Accepts `tcp://host:port`, `unix:///path` or a naked port number
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = match raw.parse::<u16>() {
            Ok(port) => format!("tcp://127.0.0.1:{}", port),
            Err(_) => raw.to_string(),
        };

        let url = Url::parse(&raw).map_err(|e| EndpointError(format!("'{}': {}", raw, e)))?;
        if url.query().is_some() || url.fragment().is_some() {
            return Err(EndpointError(format!(
                "'{}' has a query or fragment",
                raw
            )));
        }

        let host = url.host_str().filter(|h| !h.is_empty());
        match url.scheme() {
            "tcp" => {
                let host = host.ok_or_else(|| EndpointError(format!("'{}' has no host", raw)))?;
                if !url.path().is_empty() {
                    return Err(EndpointError(format!("tcp uri '{}' has a path", raw)));
                }
                match url.port() {
                    None | Some(0) => Err(EndpointError(format!(
                        "tcp uri '{}' is missing a port",
                        raw
                    ))),
                    Some(port) => Ok(ControlEndpoint::Tcp(format!("{}:{}", host, port))),
                }
            }
            "unix" => {
                if host.is_some() {
                    return Err(EndpointError(format!("unix uri '{}' has a host", raw)));
                }
                if url.path().is_empty() {
                    return Err(EndpointError(format!("unix uri '{}' has no path", raw)));
                }
                Ok(ControlEndpoint::Unix(PathBuf::from(OsString::from_vec(
                    percent_decode(url.path()),
                ))))
            }
            scheme => Err(EndpointError(format!("unknown scheme '{}'", scheme))),
        }
    }
}

/// Undo `%XX` escapes; malformed escapes are kept as written
fn percent_decode(path: &str) -> Vec<u8> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes
            .get(i + 1..i + 3)
            .filter(|hex| bytes[i] == b'%' && hex.iter().all(u8::is_ascii_hexdigit))
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match escaped {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    out
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            ControlEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint() {
        let endpoint: ControlEndpoint = DEFAULT_CONTROL_PORT.parse().unwrap();
        assert_eq!(endpoint, ControlEndpoint::Tcp("127.0.0.1:9051".to_string()));
        assert_eq!(endpoint.to_string(), DEFAULT_CONTROL_PORT);
    }

    #[test]
    fn test_naked_port() {
        assert_eq!(
            "9151".parse::<ControlEndpoint>().unwrap(),
            ControlEndpoint::Tcp("127.0.0.1:9151".to_string())
        );
    }

    #[test]
    fn test_unix_endpoint() {
        assert_eq!(
            "unix:///run/tor/control".parse::<ControlEndpoint>().unwrap(),
            ControlEndpoint::Unix(PathBuf::from("/run/tor/control"))
        );
        assert_eq!(
            "unix:/run/tor/control".parse::<ControlEndpoint>().unwrap(),
            ControlEndpoint::Unix(PathBuf::from("/run/tor/control"))
        );
    }

    #[test]
    fn test_unix_endpoint_escapes() {
        for raw in ["unix:///run/my%20tor/control", "unix:///run/my tor/control"] {
            assert_eq!(
                raw.parse::<ControlEndpoint>().unwrap(),
                ControlEndpoint::Unix(PathBuf::from("/run/my tor/control")),
                "{}",
                raw
            );
        }
        assert_eq!(
            "unix:///run/100%/control".parse::<ControlEndpoint>().unwrap(),
            ControlEndpoint::Unix(PathBuf::from("/run/100%/control"))
        );
    }

    #[test]
    fn test_invalid_endpoints() {
        for raw in [
            "tcp://127.0.0.1",
            "tcp://127.0.0.1:0",
            "tcp://127.0.0.1:9051/control",
            "tcp://127.0.0.1:9051?x=1",
            "unix://host/run/tor/control",
            "http://127.0.0.1:9051",
            "not a uri",
        ] {
            assert!(
                raw.parse::<ControlEndpoint>().is_err(),
                "{} should be rejected",
                raw
            );
        }
    }
}
