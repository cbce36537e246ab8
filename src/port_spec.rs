//! Parsing of the `VPORT[,TARGET]` onion service port specification.
//!
//! The syntax is the one the control port's `ADD_ONION Port=` argument
//! accepts:
//!
//! * `VPORT` alone mirrors the virtual port onto `127.0.0.1:VPORT`.
//! * A naked port `TARGET` maps to `127.0.0.1:TARGET`.
//! * `unix:PATH` targets a local socket.
//! * Anything else must be a resolvable `host:port`.

use std::fmt;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::str::FromStr;

const LOCALHOST: &str = "127.0.0.1";
const UNIX_PREFIX: &str = "unix:";

/// Error returned for a malformed port specification
#[derive(Debug)]
pub enum PortSpecError {
    /// No specification was given
    Empty,
    /// A port was not a decimal integer in `1..=65535`
    InvalidPort(String),
    /// A `unix:` target without a path
    EmptySocketPath,
    /// The target could not be resolved as `host:port`
    Unresolvable {
        target: String,
        source: std::io::Error,
    },
}

impl fmt::Display for PortSpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpecError::Empty => write!(f, "no onion service port specified"),
            PortSpecError::InvalidPort(port) => write!(f, "invalid port '{}'", port),
            PortSpecError::EmptySocketPath => write!(f, "unix target is missing a socket path"),
            PortSpecError::Unresolvable { target, source } => {
                write!(f, "invalid target '{}': {}", target, source)
            }
        }
    }
}

impl std::error::Error for PortSpecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PortSpecError::Unresolvable { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Where the daemon forwards connections made to the virtual port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A TCP `host:port`, kept as written
    Tcp { addr: String, port: u16 },
    /// A local (AF_UNIX) socket path
    Unix(PathBuf),
}

impl Target {
    fn localhost(port: u16) -> Self {
        Target::Tcp {
            addr: format!("{}:{}", LOCALHOST, port),
            port,
        }
    }

    /// Port component of a TCP target
    pub fn port(&self) -> Option<u16> {
        match self {
            Target::Tcp { port, .. } => Some(*port),
            Target::Unix(_) => None,
        }
    }
}

/// Bare address form: `host:port` or the socket path
impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp { addr, .. } => f.write_str(addr),
            Target::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A parsed `VPORT[,TARGET]` specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    virtual_port: u16,
    target: Target,
}

impl PortSpec {
    pub fn virtual_port(&self) -> u16 {
        self.virtual_port
    }

    /// Target port; `None` exactly when the target is a local socket
    pub fn target_port(&self) -> Option<u16> {
        self.target.port()
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Value for the control protocol's `Port=` argument
    pub fn to_port_arg(&self) -> String {
        match &self.target {
            Target::Tcp { addr, .. } => format!("{},{}", self.virtual_port, addr),
            Target::Unix(path) => {
                format!("{},{}{}", self.virtual_port, UNIX_PREFIX, path.display())
            }
        }
    }
}

impl FromStr for PortSpec {
    type Err = PortSpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        if spec.is_empty() {
            return Err(PortSpecError::Empty);
        }

        let (virtual_port, target) = match spec.split_once(',') {
            Some((vport, target)) => (parse_port(vport)?, Some(target)),
            None => (parse_port(spec)?, None),
        };

        let target = match target {
            None => Target::localhost(virtual_port),
            Some(target) => parse_target(target)?,
        };

        Ok(Self {
            virtual_port,
            target,
        })
    }
}

fn parse_target(target: &str) -> Result<Target, PortSpecError> {
    if !target.is_empty() && target.bytes().all(|b| b.is_ascii_digit()) {
        return parse_port(target).map(Target::localhost);
    }

    if let Some(path) = target.strip_prefix(UNIX_PREFIX) {
        if path.is_empty() {
            return Err(PortSpecError::EmptySocketPath);
        }
        return Ok(Target::Unix(PathBuf::from(path)));
    }

    let resolved = target
        .to_socket_addrs()
        .map_err(|source| PortSpecError::Unresolvable {
            target: target.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| PortSpecError::Unresolvable {
            target: target.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
        })?;

    if resolved.port() == 0 {
        return Err(PortSpecError::InvalidPort("0".to_string()));
    }

    Ok(Target::Tcp {
        addr: target.to_string(),
        port: resolved.port(),
    })
}

/// Parse a decimal port in `1..=65535`
fn parse_port(port: &str) -> Result<u16, PortSpecError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(PortSpecError::InvalidPort(port.to_string())),
        Ok(p) => Ok(p),
    }
}
