//! Configuration for procmux.
//!
//! Settings for `start` come from three layers: command-line flags (or their
//! `PROCMUX_*` environment variables), an optional `.procmux.toml`, and the
//! built-in defaults. `.procmux.env` files are loaded into the environment
//! before the command line is parsed, so they can supply the variables.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_SOCKET: &str = "./.procmux.sock";
pub const DEFAULT_PROCFILE: &str = "./Procfile";
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_PORT_STEP: u16 = 100;

const CONFIG_FILE: &str = ".procmux.toml";
const ENV_FILE: &str = ".procmux.env";

/// Contents of `.procmux.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Title used in the session name.
    pub title: Option<String>,
    pub procfile: Option<PathBuf>,
    /// Working directory of every process.
    pub root: Option<PathBuf>,
    /// Start only these processes.
    pub processes: Option<Vec<String>>,
    /// Processes whose exit does not stop the others.
    pub can_die: Option<Vec<String>>,
    /// Seconds per stop round.
    pub timeout: Option<u64>,
    pub port: Option<u16>,
    pub port_step: Option<u16>,
    pub socket: Option<PathBuf>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Loads `explicit`, or `.procmux.toml` from the working directory when it
/// exists. A missing default file yields an empty config.
pub fn load_or_default(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let path = Path::new(CONFIG_FILE);
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Flags of `procmux start`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct StartOptions {
    /// Title of the application, used in the session name.
    #[arg(short = 'w', long, env = "PROCMUX_TITLE")]
    pub title: Option<String>,
    /// Procfile to load.
    #[arg(short = 'f', long, env = "PROCMUX_PROCFILE")]
    pub procfile: Option<PathBuf>,
    /// Working directory of the processes. Default: the Procfile's directory.
    #[arg(short = 'd', long, env = "PROCMUX_ROOT")]
    pub root: Option<PathBuf>,
    /// Comma-separated names of the processes to start.
    #[arg(short = 'l', long, env = "PROCMUX_PROCESSES")]
    pub processes: Option<String>,
    /// Comma-separated names of processes that may exit without stopping the others.
    #[arg(short = 'c', long, env = "PROCMUX_CAN_DIE")]
    pub can_die: Option<String>,
    /// Seconds processes get to shut down before the next, harsher signal.
    #[arg(short = 't', long, env = "PROCMUX_TIMEOUT")]
    pub timeout: Option<u64>,
    /// Base port; each process gets `port + index * port_step` in `PORT`.
    #[arg(short = 'p', long, env = "PROCMUX_PORT")]
    pub port: Option<u16>,
    #[arg(short = 'P', long, env = "PROCMUX_PORT_STEP")]
    pub port_step: Option<u16>,
    /// Path of the control socket.
    #[arg(short = 's', long, env = "PROCMUX_SOCKET")]
    pub socket: Option<PathBuf>,
}

/// Fully resolved settings of one `start` run. Paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSettings {
    pub title: String,
    pub procfile: PathBuf,
    pub root: PathBuf,
    pub processes: Vec<String>,
    pub can_die: Vec<String>,
    pub timeout: Duration,
    pub port: u16,
    pub port_step: u16,
    pub socket: PathBuf,
}

impl StartSettings {
    /// Flags win over the config file, which wins over the defaults.
    pub fn resolve(mut options: StartOptions, config: Config) -> Result<Self> {
        let socket = resolve_socket(options.socket.take(), &config)?;
        let procfile = absolute(
            options
                .procfile
                .or(config.procfile)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROCFILE)),
        )?;
        let root = match options.root.or(config.root) {
            Some(root) => absolute(root)?,
            None => procfile
                .parent()
                .map(Path::to_path_buf)
                .with_context(|| format!("{} has no parent directory", procfile.display()))?,
        };
        let title = options
            .title
            .or(config.title)
            .filter(|title| !title.is_empty())
            .or_else(|| {
                root.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_default();

        Ok(Self {
            title,
            procfile,
            root,
            processes: options
                .processes
                .map(|list| split_names(&list))
                .or(config.processes)
                .unwrap_or_default(),
            can_die: options
                .can_die
                .map(|list| split_names(&list))
                .or(config.can_die)
                .unwrap_or_default(),
            timeout: Duration::from_secs(
                options
                    .timeout
                    .or(config.timeout)
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            port: options.port.or(config.port).unwrap_or(DEFAULT_PORT),
            port_step: options
                .port_step
                .or(config.port_step)
                .unwrap_or(DEFAULT_PORT_STEP),
            socket,
        })
    }
}

/// Socket path for any subcommand: flag, then config file, then default.
pub fn resolve_socket(flag: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    absolute(
        flag.or_else(|| config.socket.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET)),
    )
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    Ok(normalize(&cwd.join(path)))
}

// Drops `.` components so `./Procfile` has a usable parent.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, std::path::Component::CurDir))
        .collect()
}

/// Splits a comma-separated list, dropping blanks.
pub fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_line_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(\w+)=(.+)$").ok())
        .as_ref()
}

/// `KEY=VALUE` pairs of an env file. Other lines are ignored.
pub fn parse_env(content: &str) -> Vec<(String, String)> {
    let Some(pattern) = env_line_pattern() else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| pattern.captures(line.trim_end_matches('\r')))
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .collect()
}

fn env_files() -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Some(home) = dirs::home_dir() {
        files.push(home.join(ENV_FILE));
    }
    files.push(PathBuf::from(".").join(ENV_FILE));
    files
}

/// Exports the variables of `~/.procmux.env`, then `./.procmux.env`.
///
/// Must run before any other thread exists.
pub fn load_env_files() {
    for path in env_files() {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for (key, value) in parse_env(&content) {
            debug!(path = %path.display(), %key, "exporting variable from env file");
            std::env::set_var(key, value);
        }
    }
}
