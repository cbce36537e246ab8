#![allow(dead_code)]

use std::{
    ffi::OsString,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use duct::Expression;
use tempfile::TempDir;

const PROTOCOLINFO_REPLY: &str = "250-PROTOCOLINFO 1\r\n\
    250-AUTH METHODS=NULL\r\n\
    250-VERSION Tor=\"0.4.8.10\"\r\n\
    250 OK\r\n";

/// A stand-in for the tor daemon's control port.
///
/// Answers one control connection on a local socket: authentication always
/// succeeds and `ADD_ONION` gets the reply the test chose. Every command
/// received is recorded.
pub struct FakeTor {
    pub dir: TempDir,
    pub sock_path: PathBuf,
    commands: Arc<Mutex<Vec<String>>>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl FakeTor {
    pub fn new(add_onion_reply: &str) -> io::Result<Self> {
        let dir = TempDir::new()?;
        let sock_path = dir.path().join("control.sock");
        let listener = UnixListener::bind(&sock_path)?;

        let commands = Arc::new(Mutex::new(Vec::new()));
        let recorded = commands.clone();
        let add_onion_reply = add_onion_reply.to_string();
        let thread = thread::spawn(move || {
            let (stream, _) = listener.accept()?;
            serve(stream, &add_onion_reply, &recorded)
        });

        Ok(Self {
            dir,
            sock_path,
            commands,
            thread: Some(thread),
        })
    }

    pub fn control_port(&self) -> String {
        format!("unix://{}", self.sock_path.display())
    }

    /// Wait for the client to hang up, then return what it sent
    pub fn finish(mut self) -> io::Result<Vec<String>> {
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| io::Error::other("fake control port panicked"))??;
        }
        let commands = self.commands.lock().unwrap().clone();
        Ok(commands)
    }
}

fn serve(stream: UnixStream, add_onion_reply: &str, commands: &Mutex<Vec<String>>) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    while reader.read_line(&mut line)? > 0 {
        let command = line.trim_end().to_string();
        line.clear();
        commands.lock().unwrap().push(command.clone());

        let reply = match command.split_whitespace().next().unwrap_or_default() {
            "PROTOCOLINFO" => PROTOCOLINFO_REPLY,
            "ADD_ONION" => add_onion_reply,
            "AUTHENTICATE" | "SETEVENTS" => "250 OK\r\n",
            _ => "510 Unrecognized command\r\n",
        };
        writer.write_all(reply.as_bytes())?;
    }

    Ok(())
}

/// onionwrap pointed at `control_port`, isolated from the user's config
pub fn onionwrap<I>(config_home: &Path, control_port: &str, args: I) -> Expression
where
    I: IntoIterator,
    I::Item: Into<OsString>,
{
    let mut all_args = vec![OsString::from("--control-port"), control_port.into()];
    all_args.extend(args.into_iter().map(Into::into));

    duct::cmd(env!("CARGO_BIN_EXE_onionwrap"), all_args)
        .env("XDG_CONFIG_HOME", config_home)
        .env_remove("TOR_CONTROL_PORT")
        .env_remove("TOR_CONTROL_PASSWD")
}

/// Poll until `path` exists
pub fn wait_for_path(path: &Path, timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        if Instant::now() > deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} did not appear", path.display()),
            ));
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}
