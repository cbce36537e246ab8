//! Run a program behind a tor onion service.
//!
//! onionwrap asks a running tor daemon, over its control port, to publish an
//! onion service that forwards to a local target, then runs a worker program
//! for as long as the service exists. In inetd mode the worker is instead
//! started once per inbound connection on the target.

pub mod control;
pub mod inetd;
pub mod key;
pub mod port_spec;
pub mod supervisor;

pub use control::{ControlEndpoint, ControlError, ControlSession, ServiceHandle};
pub use inetd::{InetdError, Multiplexer};
pub use key::{KeyError, KeyType, ServiceKey};
pub use port_spec::{PortSpec, PortSpecError, Target};
pub use supervisor::{
    Completion, OsSignals, Supervisor, TerminationRequest, TerminationSource, WorkerCommand,
    WorkerError, KILL_DELAY,
};
