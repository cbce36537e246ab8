use std::{env, fs::File, io::Read, path::Path, path::PathBuf};

use clap_serde_derive::{
    clap::{self, Parser, ValueEnum},
    serde::{self, Deserialize, Serialize},
    ClapSerde,
};
use color_eyre::eyre::{Result as EyreResult, WrapErr};
use expand_tilde::ExpandTilde;
use log::LevelFilter;
use onionwrap::control::{ControlEndpoint, DEFAULT_CONTROL_PORT};
use onionwrap::{PortSpec, WorkerCommand};

const APP_VERSION: &str = env!("ONIONWRAP_BUILD_VERSION");

/// Environment variable naming the control port
pub const CONTROL_PORT_ENV: &str = "TOR_CONTROL_PORT";

fn default_config_path() -> PathBuf {
    let config_dir = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| PathBuf::from("~/.config").expand_tilde_owned().ok())
        .unwrap_or_default();

    config_dir
        .join(env!("CARGO_PKG_NAME"))
        .join(concat!(env!("CARGO_PKG_NAME"), ".toml"))
}

/// Publish a tor onion service for as long as COMMAND runs.
///
/// In the arguments of COMMAND, %VPORT, %TPORT and %TADDR are replaced by
/// the virtual port, target port and target address of the service.
#[derive(Parser)]
#[command(author, version = APP_VERSION, about)]
pub struct Args {
    /// Config file
    #[arg(short, long = "config", default_value_os_t = default_config_path())]
    pub config_path: PathBuf,

    /// Tor control port: tcp://HOST:PORT, unix:///PATH or a port number
    /// [env: TOR_CONTROL_PORT] [default: tcp://127.0.0.1:9051]
    #[arg(long = "control-port", value_name = "URI")]
    pub control_port: Option<String>,

    /// Onion service port mapping; TARGET is a port, HOST:PORT or unix:PATH
    #[arg(short, long, value_name = "VPORT[,TARGET]")]
    pub port: String,

    /// File holding the onion service's private key
    #[arg(short = 'k', long = "onion-key", value_name = "PATH")]
    pub onion_key: Option<PathBuf>,

    /// Generate a key and save it if the key file does not exist
    #[arg(short, long, requires = "onion_key")]
    pub generate: bool,

    /// Start COMMAND once per connection, attached to its stdin and stdout
    #[arg(long)]
    pub inetd: bool,

    /// Pass COMMAND's arguments through without substituting port placeholders
    #[arg(long)]
    pub no_rewrite: bool,

    /// Log debug messages (overrides --log-level)
    #[arg(short, long, conflicts_with = "quiet")]
    pub debug: bool,

    /// Only log errors (overrides --log-level)
    #[arg(short, long)]
    pub quiet: bool,

    /// Config from file or args
    #[command(flatten)]
    pub config: <Config as ClapSerde>::Opt,

    /// Command to run, followed by its arguments
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

impl Args {
    pub fn parse() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[derive(ClapSerde, Clone, Serialize)]
pub struct Config {
    /// Control port (from config file)
    #[arg(skip)]
    pub control_port: Option<String>,

    /// Log level
    #[default(LogLevel::Info)]
    #[arg(long, value_enum)]
    pub log_level: LogLevel,

    /// Optional log file (logs to standard error, otherwise)
    #[arg(long, num_args = 1)]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Merge the config file at `config_path`, if there is one, under the
    /// options given on the command line
    pub fn load(config_path: &Path, config_opt: &mut <Config as ClapSerde>::Opt) -> EyreResult<Self> {
        let mut config = if let Ok(mut f) = File::open(config_path) {
            let mut config_text = String::new();
            f.read_to_string(&mut config_text)?;
            let file_config = toml::from_str::<<Config as ClapSerde>::Opt>(&config_text)
                .wrap_err_with(|| format!("invalid config file {}", config_path.display()))?;
            Config::from(file_config).merge(config_opt)
        } else {
            Config::from(config_opt)
        };

        config.log_file = config
            .log_file
            .map(|p| p.expand_tilde_owned())
            .transpose()?;

        Ok(config)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    #[value(hide = true)]
    Trace = 5,
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Everything a run needs, resolved once from arguments, environment and
/// config file
#[derive(Debug)]
pub struct Settings {
    pub control_endpoint: ControlEndpoint,
    pub port: PortSpec,
    pub onion_key: Option<PathBuf>,
    pub generate: bool,
    pub inetd: bool,
    /// Worker command, with placeholders already substituted
    pub worker: WorkerCommand,
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(mut args: Args) -> EyreResult<Self> {
        let config = Config::load(&args.config_path, &mut args.config)?;

        let control_port = control_port(
            args.control_port,
            env::var(CONTROL_PORT_ENV).ok(),
            config.control_port,
        );
        let control_endpoint = control_port.parse::<ControlEndpoint>()?;

        let port = args
            .port
            .parse::<PortSpec>()
            .wrap_err("invalid --port")?;

        let worker = WorkerCommand::new(args.command)?;
        let worker = if args.no_rewrite {
            worker
        } else {
            worker.rewrite(&port)
        };

        let log_level = if args.debug {
            LevelFilter::Debug
        } else if args.quiet {
            LevelFilter::Error
        } else {
            config.log_level.into()
        };

        Ok(Self {
            control_endpoint,
            port,
            onion_key: args
                .onion_key
                .map(|p| p.expand_tilde_owned())
                .transpose()?,
            generate: args.generate,
            inetd: args.inetd,
            worker,
            log_level,
            log_file: config.log_file,
        })
    }
}

/// Command line, then environment, then config file, then the default.
/// Empty values count as unset.
fn control_port(cli: Option<String>, env: Option<String>, file: Option<String>) -> String {
    [cli, env, file]
        .into_iter()
        .flatten()
        .find(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_CONTROL_PORT.to_string())
}
