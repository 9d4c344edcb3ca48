mod commands;
mod config;

use accelinject_runtime::{DeviceSelector, HookKind};
use clap::{Parser, Subcommand};
use commands::EXIT_FAILURE;
use config::HookConfig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

#[derive(Debug, Parser)]
#[command(
    name = "accelinject",
    version,
    about = "OCI hook exposing accelerator devices and fabric interfaces to containers"
)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/accelinject/config.toml,
    /// then /etc/accelinject/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Inject devices and interfaces into the container owning PID.
    Hook {
        /// Process id of the container's init process.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        pid: u32,
        /// `all` or a comma-separated list of accelerator ids.
        #[arg(long, default_value = "all", value_parser = parse_selector)]
        device: DeviceSelector,
        /// Lifecycle point: prestart or createRuntime.
        #[arg(long = "hook", default_value = "createRuntime", value_parser = parse_hook)]
        hook: HookKind,
        #[arg(long)]
        mount_accelerators: Option<bool>,
        #[arg(long)]
        mount_uverbs: Option<bool>,
        /// Network routing file copied into the container.
        #[arg(long)]
        routes_file: Option<PathBuf>,
        /// Container root filesystem.
        rootfs: PathBuf,
    },
    /// List accelerator devices visible on this host.
    Devices {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Check that the host can run the hook.
    Doctor,
}

fn parse_selector(s: &str) -> Result<DeviceSelector, String> {
    s.parse().map_err(|e: accelinject_runtime::InjectError| e.to_string())
}

fn parse_hook(s: &str) -> Result<HookKind, String> {
    s.parse().map_err(|e: accelinject_runtime::InjectError| e.to_string())
}

fn init_logging(log_file: Option<&Path>, level: &str) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("ACCELINJECT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("opening log file {}: {e}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match HookConfig::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let level = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let log_file = cli.log_file.as_deref().or(config.log_file.as_deref());
    if let Err(e) = init_logging(log_file, level) {
        eprintln!("error: {e}");
        return ExitCode::from(EXIT_FAILURE);
    }

    let result = match cli.command {
        Commands::Hook {
            pid,
            device,
            hook,
            mount_accelerators,
            mount_uverbs,
            routes_file,
            rootfs,
        } => commands::hook::run(
            &config,
            commands::hook::HookArgs {
                pid,
                rootfs,
                selector: device,
                hook,
                mount_accelerators,
                mount_uverbs,
                routes_file,
            },
        ),
        Commands::Devices { json } => commands::devices::run(&config, json),
        Commands::Doctor => commands::doctor::run(),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
