pub mod availability;
pub mod config;
pub mod errors;
pub mod gdb_command;
pub mod gdbremote;
pub mod launch_config;
pub mod logging;
pub mod redirect;
pub mod replay;
pub mod runtime;
pub mod trace_dir;

use availability::{check, Availability};
use clap::{error::ErrorKind, Parser, Subcommand};
use config::{load_config, AppConfig, CliOverrides};
use errors::RrError;
use gdbremote::{GdbRemoteConnector, GdbRemoteSession};
use launch_config::{parse_launch_config, LaunchMode};
use logging::{append_run_log, clear_run_logger, init_run_logger, JsonlLogger};
use redirect::RedirectSpec;
use replay::recording::RecordOutcome;
use replay::replayer::ReplayTarget;
use replay::RrBackend;
use runtime::{ProductionSystemProbe, SystemProbe};
use serde_json::json;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "rrdbg")]
#[command(about = "Record programs with rr and replay them behind a gdb remote stub")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// rr executable to use instead of the configured one.
    #[arg(long = "rr", global = true)]
    pub rr_program: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Report whether rr can be used on this host.
    Check,
    /// Record a program and print its trace directory.
    Record {
        #[arg(long)]
        wd: Option<PathBuf>,
        #[arg(long)]
        stdin: Option<PathBuf>,
        #[arg(long)]
        stdout: Option<PathBuf>,
        #[arg(long)]
        stderr: Option<PathBuf>,
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
    /// Replay an existing trace and connect to it.
    Replay {
        trace_dir: PathBuf,
        #[arg(long, default_value_t = false)]
        delete_on_detach: bool,
        #[arg(long = "debug-info-dir")]
        debug_info_dirs: Vec<PathBuf>,
    },
    /// Record a program, then replay the new trace and connect to it.
    RecordReplay {
        #[arg(long)]
        wd: Option<PathBuf>,
        #[arg(long = "debug-info-dir")]
        debug_info_dirs: Vec<PathBuf>,
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
    /// Run an `exec` or `replay` launch configuration from a JSON file.
    Launch { path: PathBuf },
}

pub fn run() -> Result<i32, RrError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir()?;
    let mut stdout = std::io::stdout();
    run_with_probe(&args, &cwd, &ProductionSystemProbe, &mut stdout)
}

pub fn run_with_probe(
    args: &[OsString],
    cwd: &Path,
    probe: &dyn SystemProbe,
    out: &mut dyn Write,
) -> Result<i32, RrError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                write!(out, "{error}")?;
                return Ok(0);
            }
            _ => return Err(RrError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        rr_program: cli.rr_program.clone(),
        quiet: cli.quiet,
        log_file: cli.log_file.clone(),
    };
    let cfg = load_config(&overrides, cwd, probe)?;
    init_run_logger(JsonlLogger {
        budget_bytes: cfg.logging.budget_bytes,
        ..JsonlLogger::new(&cfg.logging.path)
    });
    append_run_log(
        "info",
        "run.started",
        json!({ "cwd": cwd.display().to_string(), "rr": cfg.rr.program }),
    );

    let result = execute(cli.command, &cfg, cwd, probe, out);
    append_run_log(
        "info",
        "run.finished",
        json!({
            "exit_code": result.as_ref().ok(),
            "error": result.as_ref().err().map(ToString::to_string),
        }),
    );
    clear_run_logger();
    result
}

fn execute(
    command: Commands,
    cfg: &AppConfig,
    cwd: &Path,
    probe: &dyn SystemProbe,
    out: &mut dyn Write,
) -> Result<i32, RrError> {
    let backend = RrBackend::new(probe, &cfg.rr);
    let quiet = cfg.record.quiet;
    let connector = GdbRemoteConnector::new(Duration::from_millis(cfg.replay.connect_timeout_ms));

    match command {
        Commands::Check => {
            let availability = check(probe, &cfg.rr);
            match availability {
                Availability::Available => writeln!(out, "rr: available ({})", cfg.rr.program)?,
                Availability::ToolUnavailable => {
                    writeln!(out, "rr: {} not found", cfg.rr.program)?
                }
                Availability::KernelRestricted(level) => writeln!(
                    out,
                    "rr: {} is {level}, must be <= 1",
                    cfg.rr.perf_event_paranoid_path.display()
                )?,
            }
            Ok(if availability == Availability::Available { 0 } else { 1 })
        }
        Commands::Record {
            wd,
            stdin,
            stdout,
            stderr,
            argv,
        } => {
            let work_dir = work_dir_for(cfg, cwd, wd.as_deref());
            let redirects = RedirectSpec::Paths {
                stdin: stdin.map(|p| absolutize(cwd, &p)),
                stdout: stdout.map(|p| absolutize(cwd, &p)),
                stderr: stderr.map(|p| absolutize(cwd, &p)),
            };
            let outcome = backend.record(&argv, &work_dir, quiet, &redirects)?;
            report_recording(out, &outcome)
        }
        Commands::Replay {
            trace_dir,
            delete_on_detach,
            debug_info_dirs,
        } => {
            let trace_dir = absolutize(cwd, &trace_dir);
            let dirs = debug_dirs(cfg, cwd, &debug_info_dirs);
            let target = backend.replay(
                &trace_dir,
                quiet,
                delete_on_detach || cfg.replay.delete_on_detach,
                &dirs,
                &connector,
            )?;
            report_and_detach(out, target, Path::to_path_buf)
        }
        Commands::RecordReplay {
            wd,
            debug_info_dirs,
            argv,
        } => {
            let work_dir = work_dir_for(cfg, cwd, wd.as_deref());
            let dirs = debug_dirs(cfg, cwd, &debug_info_dirs);
            let recorded = backend.record_and_replay(
                &argv,
                &work_dir,
                quiet,
                &dirs,
                &RedirectSpec::default(),
                &connector,
            )?;
            writeln!(out, "trace directory: {}", recorded.trace_dir.display())?;
            report_and_detach(out, recorded.target, Path::to_path_buf)
        }
        Commands::Launch { path } => {
            let path = absolutize(cwd, &path);
            let contents = probe.read_to_string(&path)?;
            let launch = parse_launch_config(&contents)?;
            launch.validate()?;
            append_run_log(
                "info",
                "launch.config",
                json!({ "path": path.display().to_string(), "config": launch.pretty_print() }),
            );
            for (key, value) in &launch.env {
                match value {
                    Some(value) => std::env::set_var(key, value),
                    None => std::env::remove_var(key),
                }
            }
            let dirs = debug_dirs(cfg, cwd, &[]);
            match launch.mode {
                LaunchMode::Replay => {
                    let trace_dir = launch
                        .trace_dir_path
                        .as_deref()
                        .map(|p| absolutize(cwd, p))
                        .ok_or_else(|| RrError::InvalidConfig("traceDirPath is required".to_string()))?;
                    let target = backend.replay(
                        &trace_dir,
                        quiet,
                        cfg.replay.delete_on_detach,
                        &dirs,
                        &connector,
                    )?;
                    report_and_detach(out, target, |p| launch.to_client_path(p))
                }
                _ if launch.no_debug => {
                    let work_dir = work_dir_for(cfg, cwd, launch.cwd.as_deref());
                    let outcome =
                        backend.record(&launch.argv(), &work_dir, quiet, &launch.redirect_paths())?;
                    report_recording(out, &outcome)
                }
                _ => {
                    let work_dir = work_dir_for(cfg, cwd, launch.cwd.as_deref());
                    let recorded = backend.record_and_replay(
                        &launch.argv(),
                        &work_dir,
                        quiet,
                        &dirs,
                        &launch.redirect_paths(),
                        &connector,
                    )?;
                    writeln!(out, "trace directory: {}", recorded.trace_dir.display())?;
                    report_and_detach(out, recorded.target, |p| launch.to_client_path(p))
                }
            }
        }
    }
}

fn report_recording(out: &mut dyn Write, outcome: &RecordOutcome) -> Result<i32, RrError> {
    if let Err(err) = &outcome.exit {
        writeln!(out, "recording finished with error: {err}")?;
    }
    match outcome.trace_dir() {
        Some(dir) => {
            writeln!(out, "trace directory: {}", dir.display())?;
            Ok(0)
        }
        None => {
            writeln!(out, "no trace directory was reported")?;
            Ok(1)
        }
    }
}

/// Prints what the stub reported, with the executable passed through
/// `client_path`, then detaches.
fn report_and_detach(
    out: &mut dyn Write,
    target: ReplayTarget<GdbRemoteSession>,
    client_path: impl Fn(&Path) -> PathBuf,
) -> Result<i32, RrError> {
    let session = target.session();
    writeln!(
        out,
        "connected: stub_pid={} pid={} executable={} stop={}",
        target.process().pid(),
        session
            .pid()
            .map_or_else(|| "unknown".to_string(), |pid| pid.to_string()),
        client_path(session.executable()).display(),
        session.stop_reply()
    )?;
    for dir in session.debug_info_dirs() {
        writeln!(out, "debug info: {}", dir.display())?;
    }
    target.detach(false)?;
    Ok(0)
}

fn work_dir_for(cfg: &AppConfig, cwd: &Path, requested: Option<&Path>) -> PathBuf {
    match requested {
        Some(dir) => absolutize(cwd, dir),
        None => cfg
            .record
            .working_dir
            .clone()
            .unwrap_or_else(|| cwd.to_path_buf()),
    }
}

fn debug_dirs(cfg: &AppConfig, cwd: &Path, extra: &[PathBuf]) -> Vec<PathBuf> {
    extra
        .iter()
        .map(|d| absolutize(cwd, d))
        .chain(cfg.replay.debug_info_dirs.iter().cloned())
        .collect()
}

fn absolutize(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
