use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use color_eyre::eyre::{Report, Result as EyreResult, WrapErr};
use onionwrap::control::{ControlSession, EventDrain};
use onionwrap::key::{self, KeyError, ServiceKey};
use onionwrap::supervisor::{Completion, OsSignals, Supervisor, TerminationSource, KILL_DELAY};
use onionwrap::Multiplexer;

mod cli;
mod logging;
mod systemd;

const BUILD_VERSION: &str = env!("ONIONWRAP_BUILD_VERSION");
const GIT_DESCRIBE: &str = env!("ONIONWRAP_GIT_DESCRIBE");

/// Environment variable holding the control port password
const CONTROL_PASSWD_ENV: &str = "TOR_CONTROL_PASSWD";

#[cfg(debug_assertions)]
fn install_eyre_hook() -> EyreResult<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(true)
        .install()
}

#[cfg(not(debug_assertions))]
fn install_eyre_hook() -> EyreResult<()> {
    color_eyre::config::HookBuilder::default()
        .display_env_section(false)
        .install()
}

fn main() -> ExitCode {
    if let Err(e) = install_eyre_hook() {
        eprintln!("Failed to install error hook: {}", e);
        return ExitCode::FAILURE;
    }

    let args = cli::Args::parse();

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", error_line(&e));
            ExitCode::FAILURE
        }
    }
}

/// The error and its causes on one line, skipping causes already spelled out
fn error_line(report: &Report) -> String {
    let mut line = String::new();
    for cause in report.chain() {
        let cause = cause.to_string();
        if line.contains(&cause) {
            continue;
        }
        if !line.is_empty() {
            line.push_str(": ");
        }
        line.push_str(&cause);
    }
    line
}

/// What to do about the service's private key
enum KeyPlan {
    /// No key file; the daemon's key is discarded
    Ephemeral,
    Supplied(ServiceKey),
    /// The key file does not exist yet; save what the daemon generates
    Generate(PathBuf),
}

impl KeyPlan {
    fn for_settings(settings: &cli::Settings) -> EyreResult<Self> {
        let Some(path) = &settings.onion_key else {
            return Ok(KeyPlan::Ephemeral);
        };

        match key::load(path) {
            Ok(key) => {
                log::debug!("Loaded {} key from {}", key.key_type(), path.display());
                Ok(KeyPlan::Supplied(key))
            }
            Err(KeyError::NotFound(_)) if settings.generate => {
                log::debug!("No key at {}, one will be generated", path.display());
                Ok(KeyPlan::Generate(path.clone()))
            }
            Err(e) => Err(e).wrap_err("failed to load onion key"),
        }
    }

    fn supplied(&self) -> Option<&ServiceKey> {
        match self {
            KeyPlan::Supplied(key) => Some(key),
            _ => None,
        }
    }
}

// A single worker and one control connection don't need more than one thread
#[tokio::main(flavor = "current_thread")]
async fn run(args: cli::Args) -> EyreResult<bool> {
    let settings = cli::Settings::resolve(args)?;

    // LoggerHandle must be held until program termination so file logging takes place
    let _logger = logging::setup_logger(settings.log_level, settings.log_file.as_deref())?;
    log::debug!(
        "Starting onionwrap version {}; commit {}",
        BUILD_VERSION,
        GIT_DESCRIBE
    );

    let plan = KeyPlan::for_settings(&settings)?;

    let mut session = ControlSession::connect(&settings.control_endpoint)
        .await
        .wrap_err_with(|| {
            format!(
                "failed to connect to control port {}",
                settings.control_endpoint
            )
        })?;
    let secret = env::var(CONTROL_PASSWD_ENV).ok();
    session
        .authenticate(secret.as_deref())
        .await
        .wrap_err("failed to authenticate to control port")?;

    let generate = matches!(plan, KeyPlan::Generate(_));
    let (handle, generated) = session
        .create_service(&settings.port, plan.supplied(), generate)
        .await
        .wrap_err("failed to create onion service")?;

    if let (KeyPlan::Generate(path), Some(key)) = (&plan, &generated) {
        if let Err(e) = key::save(path, key) {
            session.close().await;
            return Err(e).wrap_err_with(|| format!("failed to save onion key to {}", path.display()));
        }
        log::info!("Saved {} key to {}", key.key_type(), path.display());
    }

    log::info!("Created onion: {}", handle);
    systemd::notify_ready();
    systemd::notify_status(&format!("Serving {}", handle));

    if let Err(e) = session.subscribe_descriptor_events().await {
        log::warn!("Descriptor events unavailable: {}", e);
    }
    let mut drain = session.start_event_drain()?;
    let mut signals = OsSignals::new().wrap_err("failed to install signal handlers")?;

    let outcome = if settings.inetd {
        serve_connections(&settings, &mut drain, &mut signals).await
    } else {
        supervise(&settings, &mut drain, &mut signals).await
    };

    systemd::notify_stopping();
    drain.cancel();
    session.close().await;
    outcome
}

async fn supervise(
    settings: &cli::Settings,
    drain: &mut EventDrain,
    signals: &mut OsSignals,
) -> EyreResult<bool> {
    log::debug!("Running worker: {}", settings.worker);

    let completion = Supervisor::new(KILL_DELAY)
        .run(settings.worker.command(), signals, drain.finished())
        .await
        .wrap_err_with(|| format!("failed to run {}", settings.worker.argv()[0]))?;

    match &completion {
        Completion::Exited(status) => log::info!("Worker exited: {}", status),
        Completion::Terminated { request, .. } if completion.forced() => log::warn!(
            "Worker ignored {} for {:?} and was killed",
            request,
            KILL_DELAY
        ),
        Completion::Terminated { request, status } => {
            if let Some(status) = status {
                log::info!("Worker stopped on {}: {}", request, status)
            }
        }
        Completion::SessionEnded(end) => {
            log::error!("Control connection ended ({}), worker stopped", end)
        }
    }
    Ok(completion.success())
}

async fn serve_connections(
    settings: &cli::Settings,
    drain: &mut EventDrain,
    signals: &mut OsSignals,
) -> EyreResult<bool> {
    let multiplexer = Multiplexer::bind(settings.port.target()).await?;

    tokio::select! {
        served = multiplexer.serve(settings.worker.clone()) => match served {
            Ok(never) => match never {},
            Err(e) => Err(e).wrap_err("stopped accepting connections"),
        },
        end = drain.finished() => {
            log::error!("Control connection ended ({}), no longer serving", end);
            Ok(false)
        }
        Some(request) = signals.next_request() => {
            log::info!("Exiting on {}", request);
            Ok(true)
        }
    }
}
