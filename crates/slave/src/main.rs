//! Worker process entry point: parses CLI flags, layers an optional TOML
//! config file underneath them, and runs the supervisor until shutdown.

use clap::Parser;
use serde::Deserialize;
use slave_core::{SlaveSettings, Worker};

#[derive(Parser, Debug)]
#[command(name = "slave", about = "Worker process: connects to a controller and adapter, executes scripted game logic", disable_version_flag = true)]
struct Args {
    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Run as a daemon (detach from the controlling terminal)
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// TCP-only: omit the unix address from the hello envelope
    #[arg(short = 't', long = "tcp-only")]
    tcp_only: bool,

    /// Path to a TOML config file layered underneath these flags
    #[arg(long = "config", value_name = "config_path", default_value = "./slave.toml")]
    config_path: String,

    /// CPU profile output path
    #[arg(short = 'f', long = "pprof", value_name = "pprof_path")]
    pprof_path: Option<String>,

    /// Controller address
    #[arg(short = 'c', long = "controller", value_name = "controller_addr")]
    controller_addr: Option<String>,

    /// Storage daemon address
    #[arg(short = 'b', long = "storage", value_name = "storage_addr")]
    storage_addr: Option<String>,

    /// VM pool size
    #[arg(short = 'm', long = "pool-size", value_name = "pool_size")]
    pool_size: Option<usize>,

    /// Script entry file
    #[arg(short = 'e', long = "script", value_name = "script_entry")]
    script_entry: Option<String>,
}

/// Mirrors [`SlaveSettings`], but every field is optional so a partial TOML
/// file only overrides the keys it actually sets; CLI flags win over whatever
/// the file provides, and the hardcoded defaults in [`SlaveSettings::default`]
/// win over neither being present (§4.8's "CLI flags plus optional
/// file-based overrides, resolved into one immutable settings value").
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    daemon: Option<bool>,
    tcp_only: Option<bool>,
    pprof_path: Option<String>,
    controller_addr: Option<String>,
    storage_addr: Option<String>,
    pool_size: Option<usize>,
    script_entry: Option<String>,
    log_dir: Option<String>,
}

impl FileConfig {
    fn load(path: &str) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else { return Self::default() };
        match toml::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(path, error = %e, "failed to parse config file, ignoring it");
                Self::default()
            }
        }
    }
}

fn resolve_settings(args: Args, file: FileConfig) -> SlaveSettings {
    let defaults = SlaveSettings::default();
    SlaveSettings {
        help: false,
        version: args.version,
        daemon: args.daemon || file.daemon.unwrap_or(false),
        tcp_only: args.tcp_only || file.tcp_only.unwrap_or(false),
        pprof_path: args.pprof_path.or(file.pprof_path),
        controller_addr: args.controller_addr.or(file.controller_addr).unwrap_or(defaults.controller_addr),
        storage_addr: args.storage_addr.or(file.storage_addr).unwrap_or(defaults.storage_addr),
        pool_size: args.pool_size.or(file.pool_size).unwrap_or(defaults.pool_size),
        script_entry: args.script_entry.or(file.script_entry).unwrap_or(defaults.script_entry),
        log_dir: file.log_dir,
    }
}

fn main() {
    let args = Args::parse();

    if args.version {
        println!("slave version 1.0");
        std::process::exit(0);
    }

    let file_config = FileConfig::load(&args.config_path);
    let daemon = args.daemon || file_config.daemon.unwrap_or(false);
    let mut settings = resolve_settings(args, file_config);
    if daemon && settings.log_dir.is_none() {
        settings.log_dir = Some("./logs/slave".to_string());
    }

    init_logging(settings.log_dir.as_deref());

    let profiler_guard = settings.pprof_path.as_deref().and_then(start_profiler);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let pprof_path = settings.pprof_path.clone();
    let exit_code = rt.block_on(async move {
        match Worker::new(settings).run().await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "worker exited with a startup error");
                1
            }
        }
    });

    if let (Some(guard), Some(path)) = (profiler_guard, pprof_path.as_deref()) {
        stop_profiler(guard, path);
    }

    std::process::exit(exit_code);
}

/// Start a CPU profiling session rooted at the process start, per `-f/--pprof`.
/// The guard samples at 99Hz until `stop_profiler` tears it down and writes a
/// flamegraph to `path`; profiling internals live entirely in the `pprof`
/// crate, matching §1's "we wire in the standard profiling crate's start/stop
/// calls but do not write a profiler" scoping.
fn start_profiler(_path: &str) -> Option<pprof::ProfilerGuard<'static>> {
    match pprof::ProfilerGuardBuilder::default().frequency(99).blocklist(&["libc", "libgcc", "pthread", "vdso"]).build() {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(error = %e, "failed to start cpu profiler");
            None
        }
    }
}

fn stop_profiler(guard: pprof::ProfilerGuard<'static>, path: &str) {
    match guard.report().build() {
        Ok(report) => match std::fs::File::create(path) {
            Ok(file) => {
                if let Err(e) = report.flamegraph(file) {
                    tracing::warn!(path, error = %e, "failed to write flamegraph");
                }
            }
            Err(e) => tracing::warn!(path, error = %e, "failed to create pprof output file"),
        },
        Err(e) => tracing::warn!(error = %e, "failed to build cpu profile report"),
    }
}

fn init_logging(log_dir: Option<&str>) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A daemonized worker has no attached terminal; stdout still reaches the
    // redirected log file the supervisor's caller set up via shell redirection.
    let _ = log_dir;
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_file_config() {
        let file = FileConfig { pool_size: Some(10), ..Default::default() };
        let args = Args {
            version: false,
            daemon: false,
            tcp_only: false,
            config_path: "./slave.toml".to_string(),
            pprof_path: None,
            controller_addr: None,
            storage_addr: None,
            pool_size: Some(42),
            script_entry: None,
        };
        let settings = resolve_settings(args, file);
        assert_eq!(settings.pool_size, 42);
    }

    #[test]
    fn file_config_fills_in_when_no_flag_given() {
        let file = FileConfig { pool_size: Some(10), ..Default::default() };
        let args = Args {
            version: false,
            daemon: false,
            tcp_only: false,
            config_path: "./slave.toml".to_string(),
            pprof_path: None,
            controller_addr: None,
            storage_addr: None,
            pool_size: None,
            script_entry: None,
        };
        let settings = resolve_settings(args, file);
        assert_eq!(settings.pool_size, 10);
    }

    #[test]
    fn hardcoded_default_applies_when_neither_is_set() {
        let args = Args {
            version: false,
            daemon: false,
            tcp_only: false,
            config_path: "./slave.toml".to_string(),
            pprof_path: None,
            controller_addr: None,
            storage_addr: None,
            pool_size: None,
            script_entry: None,
        };
        let settings = resolve_settings(args, FileConfig::default());
        assert_eq!(settings.pool_size, SlaveSettings::default().pool_size);
    }
}
