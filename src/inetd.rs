//! Inetd-style connection multiplexer.
//!
//! Listens on the onion service's target address and runs one worker per
//! accepted connection, with the connection wired to the worker's stdin and
//! stdout.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};

use crate::port_spec::Target;
use crate::supervisor::{WorkerCommand, WorkerError};

/// Pause after a transient accept failure
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Error type for the connection multiplexer
#[derive(Debug)]
pub enum InetdError {
    /// Failed to listen on the target
    Bind { target: String, source: io::Error },
    /// The listener failed permanently
    Accept(io::Error),
}

impl fmt::Display for InetdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InetdError::Bind { target, source } => {
                write!(f, "failed to listen on {}: {}", target, source)
            }
            InetdError::Accept(e) => write!(f, "failed to accept connection: {}", e),
        }
    }
}

impl std::error::Error for InetdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InetdError::Bind { source, .. } => Some(source),
            InetdError::Accept(e) => Some(e),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix {
        listener: UnixListener,
        _socket: SelfDeletingSocket,
    },
}

/// Removes the listening socket file when the multiplexer goes away
struct SelfDeletingSocket {
    path: PathBuf,
}

impl Drop for SelfDeletingSocket {
    fn drop(&mut self) {
        log::debug!("Cleaning up listen socket {}", self.path.display());
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Accepts connections on the target and hands each to its own worker
pub struct Multiplexer {
    listener: Listener,
    target: Target,
}

impl Multiplexer {
    /// Listen on `target`, replacing a stale socket file if one is in the way
    pub async fn bind(target: &Target) -> Result<Self, InetdError> {
        let bind_error = |source| InetdError::Bind {
            target: target.to_string(),
            source,
        };

        let listener = match target {
            Target::Tcp { addr, .. } => {
                Listener::Tcp(TcpListener::bind(addr.as_str()).await.map_err(bind_error)?)
            }
            Target::Unix(path) => {
                match std::fs::symlink_metadata(path) {
                    Ok(meta) if meta.file_type().is_socket() => {
                        log::debug!("Removing stale socket {}", path.display());
                        std::fs::remove_file(path).map_err(bind_error)?;
                    }
                    Ok(_) => {
                        return Err(bind_error(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            "path exists and is not a socket",
                        )))
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(bind_error(e)),
                }
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                Listener::Unix {
                    listener,
                    _socket: SelfDeletingSocket { path: path.clone() },
                }
            }
        };
        log::info!("Listening for connections on {}", target);

        Ok(Self {
            listener,
            target: target.clone(),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Accept connections forever, spawning `worker` for each one.
    ///
    /// Only a non-transient accept failure ends the loop.
    pub async fn serve(self, worker: WorkerCommand) -> Result<Infallible, InetdError> {
        let worker = Arc::new(worker);
        loop {
            let accepted = match &self.listener {
                Listener::Tcp(listener) => listener.accept().await.map(|(stream, peer)| {
                    log::debug!("Accepted connection from {}", peer);
                    spawn_handler(stream, worker.clone());
                }),
                Listener::Unix { listener, .. } => listener.accept().await.map(|(stream, _)| {
                    log::debug!("Accepted local connection");
                    spawn_handler(stream, worker.clone());
                }),
            };

            if let Err(e) = accepted {
                if !is_transient(&e) {
                    return Err(InetdError::Accept(e));
                }
                log::warn!("Error accepting connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

fn spawn_handler<S>(stream: S, worker: Arc<WorkerCommand>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, &worker).await {
            log::warn!("Error handling connection: {}", e);
        }
    });
}

/// Run one worker for `stream`; the connection is closed once the
/// worker's output ends
pub async fn handle_connection<S>(stream: S, worker: &WorkerCommand) -> Result<(), WorkerError>
where
    S: AsyncRead + AsyncWrite,
{
    let mut command = worker.command();
    command.stdin(Stdio::piped()).stdout(Stdio::piped());
    let mut child = command.spawn().map_err(WorkerError::Start)?;
    let pid = child.id();
    log::debug!("Started connection worker (pid {:?})", pid);

    match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => {
            let (inbound, outbound) = tokio::io::split(stream);
            let to_worker = pump(inbound, stdin, "connection -> worker");
            let from_worker = pump(stdout, outbound, "worker -> connection");
            tokio::pin!(to_worker, from_worker);

            // The client finishing only ends the worker's input. The worker
            // finishing ends the connection, both halves of it.
            tokio::select! {
                _ = &mut to_worker => from_worker.await,
                _ = &mut from_worker => log::trace!("Connection worker {:?} output ended", pid),
            }
        }
        _ => log::warn!("Connection worker {:?} has no stdio pipes", pid),
    }

    // Ensure that it's really dead
    if let Err(e) = child.start_kill() {
        log::trace!("Final kill of connection worker: {}", e);
    }
    let status = child.wait().await.map_err(WorkerError::Wait)?;
    log::debug!("Connection worker {:?} terminated: {}", pid, status);
    Ok(())
}

/// Copy until `src` ends or either side fails, then close `dst`
async fn pump<R, W>(mut src: R, mut dst: W, direction: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut src, &mut dst).await {
        Ok(n) => log::trace!("{}: {} bytes", direction, n),
        Err(e) => log::debug!("{}: {}", direction, e),
    }
    if let Err(e) = dst.shutdown().await {
        log::trace!("{}: shutdown: {}", direction, e);
    }
}

fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => matches!(
            e.raw_os_error().map(Errno::from_raw),
            Some(Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn cat() -> WorkerCommand {
        WorkerCommand::new(vec!["cat".to_string()]).unwrap()
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(Errno::EMFILE as i32)));
        assert!(is_transient(&io::Error::from_raw_os_error(Errno::ENOBUFS as i32)));
        assert!(!is_transient(&io::Error::from_raw_os_error(Errno::EBADF as i32)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_handle_connection_pumps_both_ways() {
        let (client, server) = tokio::io::duplex(1024);
        let worker = cat();
        let handler = tokio::spawn(async move { handle_connection(server, &worker).await });

        let (mut rx, mut tx) = tokio::io::split(client);
        tx.write_all(b"hello onion\n").await.unwrap();
        tx.shutdown().await.unwrap();

        let mut echoed = String::new();
        rx.read_to_string(&mut echoed).await.unwrap();
        assert_eq!(echoed, "hello onion\n");

        handler.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_worker_start_failure_is_reported() {
        let (_client, server) = tokio::io::duplex(64);
        let worker = WorkerCommand::new(vec!["/nonexistent/onionwrap-worker".to_string()]).unwrap();
        assert!(matches!(
            handle_connection(server, &worker).await,
            Err(WorkerError::Start(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_closed_when_worker_exits() {
        let (client, server) = tokio::io::duplex(1024);
        let worker = WorkerCommand::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo hi".to_string(),
        ])
        .unwrap();
        let handler = tokio::spawn(async move { handle_connection(server, &worker).await });

        // Read the output but keep our sending side open
        let (mut rx, _tx) = tokio::io::split(client);
        let mut output = String::new();
        rx.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "hi\n");

        tokio::time::timeout(Duration::from_secs(3), handler)
            .await
            .expect("handler outlived its worker")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("service.sock");
        // A socket left behind by a listener that is gone
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let multiplexer = Multiplexer::bind(&Target::Unix(path.clone())).await.unwrap();
        assert!(path.exists());
        assert_eq!(multiplexer.target(), &Target::Unix(path.clone()));

        drop(multiplexer);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_refuses_to_replace_regular_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("important.txt");
        std::fs::write(&path, "user data").unwrap();

        assert!(matches!(
            Multiplexer::bind(&Target::Unix(path.clone())).await,
            Err(InetdError::Bind { .. })
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "user data");
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing").join("service.sock");
        assert!(matches!(
            Multiplexer::bind(&Target::Unix(path)).await,
            Err(InetdError::Bind { .. })
        ));
    }
}
