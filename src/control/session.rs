//! A control port session.
//!
//! The session owns the connection to the daemon. The service created with
//! [`ControlSession::create_service`] lives exactly as long as the connection
//! does: closing or dropping the session tears it down.

use std::fmt;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;

use super::endpoint::ControlEndpoint;
use super::protocol::{self, AuthMethod, KeyRequest, Reply, ReplyParser};
use super::ControlError;
use crate::key::ServiceKey;
use crate::port_spec::PortSpec;

type ControlReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type ControlWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a session; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    ServiceActive,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::ServiceActive => write!(f, "serving"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// A created onion service, for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    pub service_id: String,
    pub port: PortSpec,
}

impl ServiceHandle {
    pub fn onion_address(&self) -> String {
        format!("{}.onion", self.service_id)
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}",
            self.onion_address(),
            self.port.virtual_port(),
            self.port.target()
        )
    }
}

/// Connection to the daemon's control port
pub struct ControlSession {
    reader: Option<ControlReader>,
    writer: ControlWriter,
    state: SessionState,
    service_id: Option<String>,
}

impl ControlSession {
    /// Connect to the control port
    pub async fn connect(endpoint: &ControlEndpoint) -> Result<Self, ControlError> {
        log::debug!("Connecting to control port {}", endpoint);

        let classify = |e: std::io::Error| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => ControlError::ConnectionRefused(e),
            _ => ControlError::Unreachable(e),
        };

        match endpoint {
            ControlEndpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(classify)?;
                Ok(Self::from_stream(stream))
            }
            ControlEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(classify)?;
                Ok(Self::from_stream(stream))
            }
        }
    }

    /// Wrap an already established connection
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            reader: Some(BufReader::new(reader)),
            writer: Box::new(writer),
            state: SessionState::Connected,
            service_id: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn expect_state(
        &self,
        expected: SessionState,
        operation: &'static str,
    ) -> Result<(), ControlError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ControlError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Authenticate, optionally with a control port password.
    ///
    /// The method is chosen from what `PROTOCOLINFO` advertises: a supplied
    /// password is used with `HASHEDPASSWORD`, otherwise `NULL` and then
    /// `COOKIE` are tried.
    pub async fn authenticate(&mut self, secret: Option<&str>) -> Result<(), ControlError> {
        self.expect_state(SessionState::Connected, "authenticate")?;

        let info = protocol::parse_protocol_info(&self.command("PROTOCOLINFO 1").await?);
        log::debug!(
            "Daemon version {}, auth methods: {}",
            info.version.as_deref().unwrap_or("unknown"),
            info.auth_methods.join(",")
        );

        let method = match secret {
            Some(secret) if info.supports("HASHEDPASSWORD") => {
                AuthMethod::Password(secret.to_string())
            }
            _ if info.supports("NULL") => AuthMethod::Null,
            _ if info.supports("COOKIE") => {
                let path = info.cookie_file.as_ref().ok_or_else(|| {
                    ControlError::AuthFailed("COOKIE offered without a COOKIEFILE".to_string())
                })?;
                let cookie = tokio::fs::read(path).await.map_err(|e| {
                    ControlError::AuthFailed(format!(
                        "failed to read cookie file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                AuthMethod::Cookie(cookie)
            }
            _ => {
                return Err(ControlError::AuthFailed(format!(
                    "no usable authentication method (offered: {})",
                    info.auth_methods.join(",")
                )))
            }
        };

        log::debug!("Authenticating with {}", method.name());
        self.send_line(&method.command(), true).await?;
        match self.read_reply().await?.into_result() {
            Ok(_) => {}
            Err(ControlError::Rejected { message, .. }) => {
                return Err(ControlError::AuthFailed(message))
            }
            Err(e) => return Err(e),
        }

        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Create the onion service.
    ///
    /// With `key` the service uses that key. Otherwise the daemon generates
    /// one, which is returned only when `persist_if_generated` is set; the
    /// caller is responsible for saving it.
    pub async fn create_service(
        &mut self,
        spec: &PortSpec,
        key: Option<&ServiceKey>,
        persist_if_generated: bool,
    ) -> Result<(ServiceHandle, Option<ServiceKey>), ControlError> {
        self.expect_state(SessionState::Authenticated, "create a service")?;

        let request = match key {
            Some(key) => KeyRequest::Supplied(key),
            None if persist_if_generated => KeyRequest::Generate,
            None => KeyRequest::GenerateDiscard,
        };

        // The command may carry key material; keep it out of the logs
        let command = protocol::add_onion_command(&request, spec);
        self.send_line(&command, matches!(request, KeyRequest::Supplied(_)))
            .await?;
        let reply = self.read_reply().await?.into_result()?;
        let parsed = protocol::parse_add_onion(&reply, request.expects_key())?;

        self.state = SessionState::ServiceActive;
        self.service_id = Some(parsed.service_id.clone());

        let handle = ServiceHandle {
            service_id: parsed.service_id,
            port: spec.clone(),
        };
        Ok((handle, parsed.private_key))
    }

    /// Ask for `HS_DESC` events so descriptor uploads show up in the log
    pub async fn subscribe_descriptor_events(&mut self) -> Result<(), ControlError> {
        self.expect_state(SessionState::ServiceActive, "subscribe to events")?;
        self.command("SETEVENTS HS_DESC").await?;
        Ok(())
    }

    /// Hand the read side of the connection to a background task that
    /// consumes asynchronous events until the connection ends.
    pub fn start_event_drain(&mut self) -> Result<EventDrain, ControlError> {
        self.expect_state(SessionState::ServiceActive, "start the event drain")?;
        let reader = self.reader.take().ok_or(ControlError::InvalidState {
            operation: "start the event drain twice",
            state: self.state,
        })?;
        let service_id = self.service_id.clone().unwrap_or_default();

        let handle = tokio::spawn(drain_events(reader, service_id));
        Ok(EventDrain { handle, end: None })
    }

    /// Close the connection, which removes the service
    pub async fn close(mut self) {
        log::debug!("Closing control connection ({})", self.state);
        if let Err(e) = self.writer.shutdown().await {
            log::debug!("Error shutting down control connection: {}", e);
        }
        self.state = SessionState::Closed;
    }

    /// Send a command and wait for a successful reply
    async fn command(&mut self, line: &str) -> Result<Reply, ControlError> {
        self.send_line(line, false).await?;
        self.read_reply().await?.into_result()
    }

    async fn send_line(&mut self, line: &str, sensitive: bool) -> Result<(), ControlError> {
        if sensitive {
            let verb = line.split_whitespace().next().unwrap_or_default();
            log::trace!("C: {} [redacted]", verb);
        } else {
            log::trace!("C: {}", line);
        }
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next command reply, logging any events that arrive first
    async fn read_reply(&mut self) -> Result<Reply, ControlError> {
        let reader = self.reader.as_mut().ok_or(ControlError::InvalidState {
            operation: "read a reply after the event drain started",
            state: self.state,
        })?;

        loop {
            let reply = next_reply(reader).await?.ok_or(ControlError::Closed)?;
            if reply.is_event() {
                log::debug!("Event before reply: {}", reply.message());
                continue;
            }
            return Ok(reply);
        }
    }
}

/// Read one reply; `None` on a clean end of stream
async fn next_reply(reader: &mut ControlReader) -> Result<Option<Reply>, ControlError> {
    let mut parser = ReplyParser::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        // PrivateKey= lines carry key material
        if line.contains("PrivateKey=") {
            log::trace!("S: [redacted]");
        } else {
            log::trace!("S: {}", line.trim_end());
        }
        if let Some(reply) = parser.push(&line)? {
            return Ok(Some(reply));
        }
    }
}

async fn drain_events(mut reader: ControlReader, service_id: String) -> DrainEnd {
    loop {
        let reply = match next_reply(&mut reader).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return DrainEnd::Closed,
            Err(e) => return DrainEnd::Failed(e.to_string()),
        };

        if !reply.is_event() {
            log::warn!(
                "Ignoring unsolicited control reply {}: {}",
                reply.status,
                reply.message()
            );
            continue;
        }

        match protocol::parse_descriptor_event(&reply) {
            Some(event) if event.address == service_id => match event.action.as_str() {
                "UPLOADED" => log::info!(
                    "Descriptor for {}.onion uploaded to {}",
                    service_id,
                    event.hs_dir.as_deref().unwrap_or("unknown HSDir")
                ),
                "FAILED" => log::warn!(
                    "Descriptor upload for {}.onion failed: {}",
                    service_id,
                    event.reason.as_deref().unwrap_or("no reason given")
                ),
                action => log::debug!("Descriptor event {} for {}.onion", action, service_id),
            },
            _ => log::trace!("Event: {}", reply.lines.join(" ")),
        }
    }
}

/// Why the event drain stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainEnd {
    /// The daemon closed the connection
    Closed,
    /// Reading or parsing failed
    Failed(String),
    Cancelled,
}

impl fmt::Display for DrainEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainEnd::Closed => write!(f, "control connection closed"),
            DrainEnd::Failed(reason) => write!(f, "control connection failed: {}", reason),
            DrainEnd::Cancelled => write!(f, "event drain cancelled"),
        }
    }
}

/// Background task consuming control port events.
///
/// The task is aborted when this handle is dropped.
pub struct EventDrain {
    handle: JoinHandle<DrainEnd>,
    end: Option<DrainEnd>,
}

impl EventDrain {
    /// Wait for the drain to stop
    pub async fn finished(&mut self) -> DrainEnd {
        if let Some(end) = &self.end {
            return end.clone();
        }
        let end = match (&mut self.handle).await {
            Ok(end) => end,
            Err(e) if e.is_cancelled() => DrainEnd::Cancelled,
            Err(e) => DrainEnd::Failed(e.to_string()),
        };
        self.end = Some(end.clone());
        end
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for EventDrain {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
