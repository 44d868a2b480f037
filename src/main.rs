mod config;
mod dynlib;
mod error;
mod net;
mod sandbox;
mod socks5;
mod surrogate;
mod task;
mod tor;
mod utils;

use std::fs;
use std::process::ExitCode;
use std::thread;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use config::{Command, Config, Dirs, InstanceLock};
use error::Error;
use tor::Tor;

fn main() -> ExitCode {
    // Disable core dumps and ptrace before anything sensitive exists.
    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0 as libc::c_ulong) } != 0 {
        eprintln!(
            "failed to disable core dumps: {}",
            std::io::Error::last_os_error()
        );
        return ExitCode::FAILURE;
    }

    let cfg = Config::parse();

    let default_level = match cfg.debug.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(&cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.downcast_ref::<Error>().is_some_and(Error::is_canceled) {
                info!("canceled");
                return ExitCode::SUCCESS;
            }
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cfg: &Config) -> anyhow::Result<()> {
    if !dynlib::is_supported() {
        return Err(Error::Fatal("only 64-bit Linux hosts are supported".into()).into());
    }

    // Everything the sandboxes spawn inherits the launcher's limits.
    sandbox::set_sensible_rlimits()?;

    let dirs = Dirs::resolve(cfg)?;
    let _lock = InstanceLock::acquire(&dirs.runtime)?;

    match &cfg.command {
        Some(Command::Update { mar }) => {
            let mar = fs::read(mar)
                .with_context(|| format!("failed to read update archive {}", mar.display()))?;
            sandbox::app::run_update(cfg, &dirs, &mar, None)?;
            info!("update applied");
            Ok(())
        }
        Some(Command::Run) | None => launch(cfg, &dirs),
    }
}

fn launch(cfg: &Config, dirs: &Dirs) -> anyhow::Result<()> {
    let tor = if cfg.tor.system_tor {
        let endpoint = cfg.tor.control_endpoint.clone().ok_or_else(|| {
            Error::Config("--control-endpoint is required with --system-tor".into())
        })?;
        Tor::system(endpoint).context("failed to attach to the system tor")?
    } else {
        let torrc = sandbox::app::build_torrc(cfg);
        let process =
            sandbox::app::run_tor(cfg, dirs, torrc, None).context("failed to launch tor")?;
        Tor::sandboxed(process, &dirs.tor_data)
    };

    // Bootstrap runs on a worker; progress lands in the log.
    let (task, handle) = task::new_task(|msg| info!("{msg}"));
    let worker_tor = tor.clone();
    thread::spawn(move || {
        let result = worker_tor.bootstrap(&task);
        task.finish(result);
    });
    if let Err(e) = handle.wait() {
        tor.shutdown();
        return Err(e).context("tor bootstrap failed");
    }

    tor.launch_surrogates(&dirs.runtime, cfg.sandbox.enable_circuit_display)
        .context("failed to launch the surrogates")?;

    let mut browser = match sandbox::app::run_browser(cfg, dirs, &tor, None) {
        Ok(browser) => browser,
        Err(e) => {
            tor.shutdown();
            return Err(e).context("failed to launch the browser");
        }
    };

    info!("browser is running");
    browser.wait();
    tor.shutdown();
    Ok(())
}
