//! Worker process supervision.
//!
//! The worker is started once the onion service exists. Supervision ends
//! when the worker exits, when the control session ends, or when a
//! termination request arrives; requests are forwarded to the worker as the
//! same signal and followed by a forced kill if the worker outlives
//! [`KILL_DELAY`].

use std::fmt;
use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::control::DrainEnd;
use crate::port_spec::PortSpec;

/// How long a worker may take to exit after a forwarded signal
pub const KILL_DELAY: Duration = Duration::from_secs(5);

/// Error type for worker process operations
#[derive(Debug)]
pub enum WorkerError {
    /// No command was given to wrap
    NoCommand,
    /// The worker could not be started
    Start(std::io::Error),
    /// Waiting for the worker failed
    Wait(std::io::Error),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::NoCommand => write!(f, "no command specified to wrap"),
            WorkerError::Start(e) => write!(f, "failed to start worker: {}", e),
            WorkerError::Wait(e) => write!(f, "failed to wait for worker: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Start(e) | WorkerError::Wait(e) => Some(e),
            WorkerError::NoCommand => None,
        }
    }
}

/// The wrapped command and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    argv: Vec<String>,
}

impl WorkerCommand {
    pub fn new(argv: Vec<String>) -> Result<Self, WorkerError> {
        if argv.is_empty() {
            return Err(WorkerError::NoCommand);
        }
        Ok(Self { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Substitute the port placeholders in every argument after the program.
    ///
    /// * `%VPORT` - the virtual port
    /// * `%TPORT` - the target port; left alone for local socket targets
    /// * `%TADDR` - the whole target
    pub fn rewrite(&self, spec: &PortSpec) -> Self {
        let vport = spec.virtual_port().to_string();
        let tport = spec.target_port().map(|p| p.to_string());
        let taddr = spec.target().to_string();

        let mut argv = self.argv.clone();
        for arg in argv.iter_mut().skip(1) {
            let mut rewritten = arg.replace("%VPORT", &vport);
            if let Some(tport) = &tport {
                rewritten = rewritten.replace("%TPORT", tport);
            }
            *arg = rewritten.replace("%TADDR", &taddr);
        }
        Self { argv }
    }

    /// A fresh command for one worker instance; stdio is inherited unless
    /// the caller overrides it
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.argv[0]);
        command.args(&self.argv[1..]).kill_on_drop(true);
        command
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

/// A request to stop the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationRequest {
    Interrupt,
    Terminate,
}

impl TerminationRequest {
    /// Signal forwarded to the worker
    pub fn signal(self) -> Signal {
        match self {
            TerminationRequest::Interrupt => Signal::SIGINT,
            TerminationRequest::Terminate => Signal::SIGTERM,
        }
    }
}

impl fmt::Display for TerminationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signal())
    }
}

/// Source of termination requests
pub trait TerminationSource {
    /// Resolves with the next request, or `None` once no more can arrive
    fn next_request(&mut self) -> impl Future<Output = Option<TerminationRequest>> + Send;
}

/// SIGINT and SIGTERM delivered to this process
pub struct OsSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

impl OsSignals {
    /// Install the handlers; from here on the signals no longer kill us
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }
}

impl TerminationSource for OsSignals {
    fn next_request(&mut self) -> impl Future<Output = Option<TerminationRequest>> + Send {
        async move {
            tokio::select! {
                Some(()) = self.interrupt.recv() => Some(TerminationRequest::Interrupt),
                Some(()) = self.terminate.recv() => Some(TerminationRequest::Terminate),
                else => None,
            }
        }
    }
}

impl TerminationSource for mpsc::Receiver<TerminationRequest> {
    fn next_request(&mut self) -> impl Future<Output = Option<TerminationRequest>> + Send {
        self.recv()
    }
}

/// Why supervision ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The worker exited on its own
    Exited(ExitStatus),
    /// A termination request was forwarded; `status` is `None` when the
    /// worker had to be killed after the grace period
    Terminated {
        request: TerminationRequest,
        status: Option<ExitStatus>,
    },
    /// The control session ended first and the worker was killed
    SessionEnded(DrainEnd),
}

impl Completion {
    /// Whether the worker finished cleanly with status 0
    pub fn success(&self) -> bool {
        match self {
            Completion::Exited(status) => status.success(),
            Completion::Terminated {
                status: Some(status),
                ..
            } => status.success(),
            _ => false,
        }
    }

    /// Whether the worker had to be killed after ignoring a forwarded signal
    pub fn forced(&self) -> bool {
        matches!(self, Completion::Terminated { status: None, .. })
    }
}

/// Runs one worker to completion
#[derive(Debug, Clone)]
pub struct Supervisor {
    kill_delay: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(KILL_DELAY)
    }
}

impl Supervisor {
    pub fn new(kill_delay: Duration) -> Self {
        Self { kill_delay }
    }

    /// Start `command` and wait for whichever comes first: the worker
    /// exiting, `session_end` resolving, or a termination request.
    ///
    /// The worker is always killed and reaped before this returns.
    pub async fn run<T, S>(
        &self,
        mut command: Command,
        terminations: &mut T,
        session_end: S,
    ) -> Result<Completion, WorkerError>
    where
        T: TerminationSource,
        S: Future<Output = DrainEnd>,
    {
        let mut child = command
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Start)?;
        let pid = child.id();
        log::debug!("Started worker (pid {:?})", pid);

        tokio::pin!(session_end);

        let completion = tokio::select! {
            status = child.wait() => Completion::Exited(status.map_err(WorkerError::Wait)?),
            end = &mut session_end => Completion::SessionEnded(end),
            Some(request) = terminations.next_request() => {
                log::debug!("Received {}, forwarding to worker", request);
                forward(pid, request);

                tokio::select! {
                    status = child.wait() => Completion::Terminated {
                        request,
                        status: Some(status.map_err(WorkerError::Wait)?),
                    },
                    end = &mut session_end => Completion::SessionEnded(end),
                    _ = tokio::time::sleep(self.kill_delay) => {
                        log::debug!("Worker still running {:?} after {}, killing it", self.kill_delay, request);
                        Completion::Terminated { request, status: None }
                    }
                }
            }
        };

        // Ensure that it's really dead
        if let Err(e) = child.start_kill() {
            log::trace!("Final kill of worker: {}", e);
        }
        let status = child.wait().await.map_err(WorkerError::Wait)?;
        log::debug!("Worker terminated: {}", status);

        Ok(completion)
    }
}

fn forward(pid: Option<u32>, request: TerminationRequest) {
    let Some(pid) = pid else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), request.signal()) {
        log::debug!("Failed to forward {} to worker {}: {}", request, pid, e);
    }
}
