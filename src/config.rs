use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};
use crate::net::Endpoint;
use crate::utils::{self, DIR_MODE};

const APP_DIR: &str = "burrow";

const HEADING_SANDBOX: &str = "Sandbox";
const HEADING_TOR: &str = "Tor";
const HEADING_DEBUG: &str = "Debug";

#[derive(Parser, Debug)]
#[command(name = "burrow", about = "Sandboxed Tor Browser launcher")]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub sandbox: SandboxOptions,

    #[command(flatten)]
    pub tor: TorOptions,

    #[command(flatten)]
    pub debug: DebugOptions,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch the sandboxed browser (the default).
    Run,
    /// Apply a downloaded MAR update to the installed bundle.
    Update {
        /// Path to the update archive.
        mar: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct SandboxOptions {
    #[arg(
        long,
        help = "Bundle installation directory",
        help_heading = HEADING_SANDBOX
    )]
    pub bundle_dir: Option<PathBuf>,

    #[arg(long, help = "Override the X11 display", help_heading = HEADING_SANDBOX)]
    pub display: Option<String>,

    #[arg(
        long,
        help = "Host directory backing the sandbox Desktop",
        help_heading = HEADING_SANDBOX
    )]
    pub desktop_dir: Option<PathBuf>,

    #[arg(
        long,
        help = "Host directory backing the sandbox Downloads",
        help_heading = HEADING_SANDBOX
    )]
    pub downloads_dir: Option<PathBuf>,

    #[arg(
        long,
        help = "Discard browser profile changes on exit",
        help_heading = HEADING_SANDBOX
    )]
    pub amnesiac_profile: bool,

    #[arg(
        long,
        help = "Expose the host AV codec library to the browser",
        help_heading = HEADING_SANDBOX
    )]
    pub enable_av_codec: bool,

    #[arg(
        long,
        help = "Enable the per-site circuit display",
        help_heading = HEADING_SANDBOX
    )]
    pub enable_circuit_display: bool,

    #[arg(
        long,
        help = "Path to the bubblewrap helper binary",
        help_heading = HEADING_SANDBOX
    )]
    pub helper: Option<PathBuf>,

    #[arg(
        long,
        help = "Path to the LD_PRELOAD companion stub",
        help_heading = HEADING_SANDBOX
    )]
    pub stub: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct TorOptions {
    #[arg(
        long,
        help = "Use a host tor service instead of launching one",
        help_heading = HEADING_TOR
    )]
    pub system_tor: bool,

    #[arg(
        long,
        help = "Control endpoint of the host tor service (unix:/path or tcp:host:port)",
        value_parser = parse_endpoint,
        requires = "system_tor",
        help_heading = HEADING_TOR
    )]
    pub control_endpoint: Option<Endpoint>,

    #[arg(long, help = "Connect through bridges", help_heading = HEADING_TOR)]
    pub use_bridges: bool,

    #[arg(
        long = "bridge",
        value_name = "LINE",
        help = "Bridge line (repeatable)",
        requires = "use_bridges",
        help_heading = HEADING_TOR
    )]
    pub bridges: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DebugOptions {
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase log verbosity",
        help_heading = HEADING_DEBUG
    )]
    pub verbose: u8,
}

impl Config {
    #[cfg(test)]
    pub(crate) fn default_for_tests() -> Config {
        Config::parse_from(["burrow"])
    }
}

fn parse_endpoint(s: &str) -> Result<Endpoint, String> {
    Endpoint::parse(s).map_err(|e| e.to_string())
}

/// The XDG base directories the launcher works out of.  Runtime sockets are
/// only ever placed under the runtime dir; persistent state under the data
/// dir.
#[derive(Debug, Clone)]
pub struct Dirs {
    pub runtime: PathBuf,
    pub data: PathBuf,
    pub tor_data: PathBuf,
    pub bundle: PathBuf,
}

impl Dirs {
    pub fn resolve(cfg: &Config) -> Result<Dirs> {
        let runtime = env_dir("XDG_RUNTIME_DIR", None)?.join(APP_DIR);
        let data = env_dir("XDG_DATA_HOME", Some(".local/share"))?.join(APP_DIR);
        let config = env_dir("XDG_CONFIG_HOME", Some(".config"))?.join(APP_DIR);

        for dir in [&runtime, &data, &config] {
            utils::create_directory_recursive(dir, DIR_MODE)?;
        }

        let tor_data = data.join("tor");
        let bundle = cfg
            .sandbox
            .bundle_dir
            .clone()
            .unwrap_or_else(|| data.join("tor-browser"));

        Ok(Dirs {
            runtime,
            data,
            tor_data,
            bundle,
        })
    }
}

fn env_dir(var: &str, home_fallback: Option<&str>) -> Result<PathBuf> {
    match env::var(var) {
        Ok(v) if !v.is_empty() => Ok(PathBuf::from(v)),
        _ => match home_fallback {
            Some(rel) => {
                let home = env::var("HOME")
                    .map_err(|_| Error::Config(format!("neither {var} nor HOME is set")))?;
                Ok(Path::new(&home).join(rel))
            }
            None => Err(Error::Config(format!("{var} is not set"))),
        },
    }
}

/// Holds the exclusive single-instance lock for as long as it lives.
pub struct InstanceLock {
    _lock: Flock<File>,
}

impl InstanceLock {
    pub fn acquire(runtime_dir: &Path) -> Result<InstanceLock> {
        let path = runtime_dir.join("lock");
        let file = File::create(&path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(InstanceLock { _lock: lock }),
            Err((_, _)) => Err(Error::Config(
                "another instance is already running".into(),
            )),
        }
    }
}
