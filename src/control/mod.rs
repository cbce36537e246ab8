//! Client side of the tor control port.
//!
//! This module provides:
//! - Parsing of control port addresses
//! - Reply framing and the handful of commands onionwrap needs
//!   (`PROTOCOLINFO`, `AUTHENTICATE`, `ADD_ONION`, `SETEVENTS`)
//! - A session that creates an onion service and drains events for as long
//!   as the service should live

pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod session;

pub use endpoint::{ControlEndpoint, EndpointError, DEFAULT_CONTROL_PORT};
pub use error::ControlError;
pub use session::{ControlSession, DrainEnd, EventDrain, ServiceHandle, SessionState};
