use crate::errors::RrError;
use crate::logging::DEFAULT_DISK_BUDGET_BYTES;
use crate::runtime::SystemProbe;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_PERF_EVENT_PARANOID_PATH: &str = "/proc/sys/kernel/perf_event_paranoid";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub rr_program: Option<String>,
    pub quiet: bool,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub rr: RrToolConfig,
    pub record: RecordConfig,
    pub replay: ReplayConfig,
    pub logging: LoggingConfig,
}

/// Where to find `rr` and the kernel setting it depends on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RrToolConfig {
    pub program: String,
    pub perf_event_paranoid_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordConfig {
    pub quiet: bool,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayConfig {
    pub delete_on_detach: bool,
    pub debug_info_dirs: Vec<PathBuf>,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: PathBuf,
    pub budget_bytes: u64,
}

impl Default for RrToolConfig {
    fn default() -> Self {
        Self {
            program: "rr".to_string(),
            perf_event_paranoid_path: PathBuf::from(DEFAULT_PERF_EVENT_PARANOID_PATH),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rr: RrToolConfig::default(),
            record: RecordConfig {
                quiet: false,
                working_dir: None,
            },
            replay: ReplayConfig {
                delete_on_detach: false,
                debug_info_dirs: Vec::new(),
                connect_timeout_ms: 5000,
            },
            logging: LoggingConfig {
                path: PathBuf::from(".rrdbg/logs/run.jsonl"),
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    rr: Option<PartialRrToolConfig>,
    record: Option<PartialRecordConfig>,
    replay: Option<PartialReplayConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialRrToolConfig {
    program: Option<String>,
    perf_event_paranoid_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialRecordConfig {
    quiet: Option<bool>,
    working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialReplayConfig {
    delete_on_detach: Option<bool>,
    debug_info_dirs: Option<Vec<PathBuf>>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    budget_bytes: Option<u64>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    probe: &dyn SystemProbe,
) -> Result<AppConfig, RrError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let path = absolutize_path(process_cwd, path);
        let file_contents = probe.read_to_string(&path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| RrError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    resolve_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn parse_config_str(contents: &str) -> Result<AppConfig, RrError> {
    let partial: PartialAppConfig =
        toml::from_str(contents).map_err(|e| RrError::ConfigParse(e.to_string()))?;
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, partial);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(rr) = partial.rr {
        if let Some(program) = rr.program {
            cfg.rr.program = program;
        }
        if let Some(path) = rr.perf_event_paranoid_path {
            cfg.rr.perf_event_paranoid_path = path;
        }
    }

    if let Some(record) = partial.record {
        if let Some(quiet) = record.quiet {
            cfg.record.quiet = quiet;
        }
        if let Some(working_dir) = record.working_dir {
            cfg.record.working_dir = Some(working_dir);
        }
    }

    if let Some(replay) = partial.replay {
        if let Some(value) = replay.delete_on_detach {
            cfg.replay.delete_on_detach = value;
        }
        if let Some(value) = replay.debug_info_dirs {
            cfg.replay.debug_info_dirs = value;
        }
        if let Some(value) = replay.connect_timeout_ms {
            cfg.replay.connect_timeout_ms = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.path {
            cfg.logging.path = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(program) = &overrides.rr_program {
        cfg.rr.program = program.clone();
    }
    if overrides.quiet {
        cfg.record.quiet = true;
    }
    if let Some(path) = &overrides.log_file {
        cfg.logging.path = path.clone();
    }
}

fn resolve_paths(cfg: &mut AppConfig, process_cwd: &Path) {
    if let Some(dir) = &cfg.record.working_dir {
        cfg.record.working_dir = Some(absolutize_path(process_cwd, dir));
    }
    cfg.logging.path = absolutize_path(process_cwd, &cfg.logging.path);
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), RrError> {
    if cfg.rr.program.trim().is_empty() {
        return Err(RrError::InvalidConfig(
            "rr.program must not be empty".to_string(),
        ));
    }
    if cfg.replay.connect_timeout_ms == 0 {
        return Err(RrError::InvalidConfig(
            "replay.connect_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.logging.budget_bytes == 0 {
        return Err(RrError::InvalidConfig(
            "logging.budget_bytes must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{load_config, parse_config_str, AppConfig, CliOverrides};
    use crate::errors::RrError;
    use crate::runtime::FakeSystemProbe;
    use std::path::{Path, PathBuf};

    #[test]
    fn defaults_apply_without_a_config_file() {
        let cfg = load_config(
            &CliOverrides::default(),
            Path::new("/work"),
            &FakeSystemProbe::default(),
        )
        .expect("config");
        assert_eq!(cfg.rr.program, "rr");
        assert_eq!(
            cfg.rr.perf_event_paranoid_path,
            PathBuf::from("/proc/sys/kernel/perf_event_paranoid")
        );
        assert_eq!(cfg.logging.path, PathBuf::from("/work/.rrdbg/logs/run.jsonl"));
        assert!(!cfg.replay.delete_on_detach);
    }

    #[test]
    fn file_values_merge_and_cli_overrides_win() {
        let probe = FakeSystemProbe::default().with_file(
            "/work/rrdbg.toml",
            r#"
[rr]
program = "/opt/rr/bin/rr"
[record]
quiet = false
working_dir = "sub"
[replay]
delete_on_detach = true
debug_info_dirs = ["/usr/lib/debug"]
"#,
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("rrdbg.toml")),
            quiet: true,
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, Path::new("/work"), &probe).expect("config");
        assert_eq!(cfg.rr.program, "/opt/rr/bin/rr");
        assert!(cfg.record.quiet);
        assert_eq!(cfg.record.working_dir, Some(PathBuf::from("/work/sub")));
        assert!(cfg.replay.delete_on_detach);
        assert_eq!(cfg.replay.debug_info_dirs, vec![PathBuf::from("/usr/lib/debug")]);
        assert_eq!(cfg.replay.connect_timeout_ms, 5000);
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let err = parse_config_str("[rr]\nprogam = \"rr\"\n").expect_err("typo rejected");
        assert!(matches!(err, RrError::ConfigParse(_)));
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let err = parse_config_str("[replay]\nconnect_timeout_ms = 0\n").expect_err("invalid");
        assert!(matches!(err, RrError::InvalidConfig(_)));
    }

    #[test]
    fn empty_document_equals_defaults() {
        assert_eq!(parse_config_str("").expect("config"), AppConfig::default());
    }
}
