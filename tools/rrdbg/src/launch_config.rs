//! JSON launch configuration accepted by `rrdbg launch`.

use crate::errors::RrError;
use crate::redirect::RedirectSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_BACKEND: &str = "default";
const ACCEPTED_BACKENDS: [&str; 2] = [DEFAULT_BACKEND, "rr"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Debug,
    Test,
    Exec,
    Replay,
    Core,
}

impl LaunchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchMode::Debug => "debug",
            LaunchMode::Test => "test",
            LaunchMode::Exec => "exec",
            LaunchMode::Replay => "replay",
            LaunchMode::Core => "core",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSubstitutePath")]
pub struct SubstitutePath {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize)]
struct RawSubstitutePath {
    from: Option<String>,
    to: Option<String>,
}

impl TryFrom<RawSubstitutePath> for SubstitutePath {
    type Error = String;

    fn try_from(raw: RawSubstitutePath) -> Result<Self, Self::Error> {
        match (raw.from, raw.to) {
            (Some(from), Some(to)) => Ok(Self { from, to }),
            _ => Err("'substitutePath' requires both 'from' and 'to' entries".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchCommon {
    pub backend: String,
    /// `from` is the client-side prefix, `to` the one the debugger sees.
    pub substitute_path: Vec<SubstitutePath>,
}

impl Default for LaunchCommon {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            substitute_path: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputRedirects {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    pub mode: LaunchMode,
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub trace_dir_path: Option<PathBuf>,
    /// Record without replaying.
    pub no_debug: bool,
    /// `null` values unset the variable.
    pub env: BTreeMap<String, Option<String>>,
    pub output_redirects: OutputRedirects,
    #[serde(flatten)]
    pub common: LaunchCommon,
}

pub fn parse_launch_config(json: &str) -> Result<LaunchConfig, RrError> {
    let config: LaunchConfig = serde_json::from_str(json)
        .map_err(|e| RrError::InvalidConfig(format!("invalid launch configuration: {e}")))?;
    Ok(config)
}

impl LaunchConfig {
    pub fn validate(&self) -> Result<(), RrError> {
        let missing = |attr: &str| {
            RrError::InvalidConfig(format!(
                "the '{attr}' attribute is missing in debug configuration for mode '{}'",
                self.mode.as_str()
            ))
        };
        if !ACCEPTED_BACKENDS.contains(&self.common.backend.as_str()) {
            return Err(RrError::InvalidConfig(format!(
                "backend '{}' cannot be served by rrdbg; use 'rr' or 'default'",
                self.common.backend
            )));
        }
        match self.mode {
            LaunchMode::Replay if is_blank(&self.trace_dir_path) => Err(missing("traceDirPath")),
            LaunchMode::Exec if is_blank(&self.program) => Err(missing("program")),
            LaunchMode::Replay | LaunchMode::Exec => Ok(()),
            other => Err(RrError::InvalidConfig(format!(
                "mode '{}' is not supported by the rr backend",
                other.as_str()
            ))),
        }
    }

    pub fn pretty_print(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("<unprintable: {e}>"))
    }

    pub fn redirect_paths(&self) -> RedirectSpec<'static> {
        RedirectSpec::Paths {
            stdin: self.output_redirects.stdin.clone(),
            stdout: self.output_redirects.stdout.clone(),
            stderr: self.output_redirects.stderr.clone(),
        }
    }

    /// Maps a path reported by the debugger back to the client's view using
    /// the first matching `substitutePath` rule. An empty `to` matches
    /// relative paths only.
    pub fn to_client_path(&self, path: &Path) -> PathBuf {
        for rule in &self.common.substitute_path {
            if rule.to.is_empty() {
                if path.is_relative() {
                    return Path::new(&rule.from).join(path);
                }
                continue;
            }
            if let Ok(rest) = path.strip_prefix(&rule.to) {
                return Path::new(&rule.from).join(rest);
            }
        }
        path.to_path_buf()
    }

    /// `program` followed by `args`.
    pub fn argv(&self) -> Vec<String> {
        self.program
            .iter()
            .map(|p| p.display().to_string())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

fn is_blank(path: &Option<PathBuf>) -> bool {
    path.as_ref().map_or(true, |p| p.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_object() {
        let config = parse_launch_config("{}").expect("parse");
        assert_eq!(config.mode, LaunchMode::Debug);
        assert_eq!(config.common.backend, "default");
        assert!(!config.no_debug);
        assert!(config.env.is_empty());
    }

    #[test]
    fn replay_config_with_common_fields_and_env() {
        let config = parse_launch_config(
            r#"{
                "mode": "replay",
                "traceDirPath": "/tmp/trace-0",
                "stopOnEntry": true,
                "backend": "rr",
                "substitutePath": [{"from": "/src", "to": ""}],
                "env": {"A": "1", "B": null}
            }"#,
        )
        .expect("parse");
        assert_eq!(config.mode, LaunchMode::Replay);
        assert_eq!(config.trace_dir_path, Some(PathBuf::from("/tmp/trace-0")));
        assert_eq!(config.common.backend, "rr");
        assert_eq!(config.common.substitute_path[0].to, "");
        assert_eq!(config.env.get("B"), Some(&None));
        config.validate().expect("valid");
    }

    #[test]
    fn substitute_path_needs_both_ends() {
        let err = parse_launch_config(r#"{"substitutePath": [{"from": "/src"}]}"#)
            .expect_err("missing to");
        assert!(err
            .to_string()
            .contains("'substitutePath' requires both 'from' and 'to' entries"));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = parse_launch_config(r#"{"mode": "remote"}"#).expect_err("bad mode");
        assert!(matches!(err, RrError::InvalidConfig(_)));
    }

    #[test]
    fn validate_requires_mode_specific_paths() {
        let replay = parse_launch_config(r#"{"mode": "replay"}"#).expect("parse");
        assert!(replay.validate().expect_err("no trace").to_string().contains("traceDirPath"));

        let exec = parse_launch_config(r#"{"mode": "exec", "program": ""}"#).expect("parse");
        assert!(exec.validate().expect_err("no program").to_string().contains("program"));

        let debug = parse_launch_config(r#"{"program": "/bin/true"}"#).expect("parse");
        assert!(debug.validate().expect_err("debug").to_string().contains("not supported"));
    }

    #[test]
    fn non_rr_backend_is_rejected() {
        let config =
            parse_launch_config(r#"{"mode": "exec", "program": "/bin/true", "backend": "native"}"#)
                .expect("parse");
        let err = config.validate().expect_err("native backend");
        assert!(err.to_string().contains("backend 'native'"));
    }

    #[test]
    fn debugger_paths_map_back_through_substitute_rules() {
        let config = parse_launch_config(
            r#"{"substitutePath": [
                {"from": "/home/me/src", "to": "/build/src"},
                {"from": "/home/me/trimmed", "to": ""}
            ]}"#,
        )
        .expect("parse");
        assert_eq!(
            config.to_client_path(Path::new("/build/src/bin/app")),
            PathBuf::from("/home/me/src/bin/app")
        );
        assert_eq!(
            config.to_client_path(Path::new("pkg/main")),
            PathBuf::from("/home/me/trimmed/pkg/main")
        );
        assert_eq!(
            config.to_client_path(Path::new("/usr/bin/true")),
            PathBuf::from("/usr/bin/true")
        );
    }

    #[test]
    fn exec_argv_and_redirects() {
        let config = parse_launch_config(
            r#"{"mode": "exec", "program": "/bin/echo", "args": ["hi"],
                "outputRedirects": {"stdout": "/tmp/out.txt"}}"#,
        )
        .expect("parse");
        assert_eq!(config.argv(), vec!["/bin/echo", "hi"]);
        match config.redirect_paths() {
            RedirectSpec::Paths { stdin, stdout, .. } => {
                assert_eq!(stdin, None);
                assert_eq!(stdout, Some(PathBuf::from("/tmp/out.txt")));
            }
            RedirectSpec::Handles { .. } => panic!("expected path redirects"),
        }
        assert!(config.pretty_print().contains("\"mode\": \"exec\""));
    }
}
