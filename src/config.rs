//! Project configuration — `.taubench/config.toml`.
//!
//! Found by walking upward from the working directory, every field
//! defaulted so a missing file is never an error. The executable path
//! can be persisted back to the file once the user supplies one, so
//! the next run finds the interpreter without flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::SessionOptions;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".taubench";

fn default_submit_timeout_secs() -> u64 {
    30
}

fn default_probe_quiet_millis() -> u64 {
    300
}

fn default_probe_deadline_secs() -> u64 {
    5
}

fn default_buffer_limit_bytes() -> usize {
    256 * 1024
}

fn default_terminate_grace_millis() -> u64 {
    2000
}

fn default_comment_marker() -> String {
    "#".to_string()
}

fn default_step_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplSettings {
    /// Path to the REPL executable.
    #[serde(default)]
    pub executable: Option<String>,
    /// Startup flags passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Fixed prompt sentinel. Probed at session start when unset.
    #[serde(default)]
    pub sentinel: Option<String>,
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
    #[serde(default = "default_probe_quiet_millis")]
    pub probe_quiet_millis: u64,
    #[serde(default = "default_probe_deadline_secs")]
    pub probe_deadline_secs: u64,
    #[serde(default = "default_buffer_limit_bytes")]
    pub buffer_limit_bytes: usize,
    #[serde(default = "default_terminate_grace_millis")]
    pub terminate_grace_millis: u64,
}

impl Default for ReplSettings {
    fn default() -> Self {
        Self {
            executable: None,
            args: vec![],
            sentinel: None,
            submit_timeout_secs: default_submit_timeout_secs(),
            probe_quiet_millis: default_probe_quiet_millis(),
            probe_deadline_secs: default_probe_deadline_secs(),
            buffer_limit_bytes: default_buffer_limit_bytes(),
            terminate_grace_millis: default_terminate_grace_millis(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptSettings {
    /// Lines starting with this marker are display-only.
    #[serde(default = "default_comment_marker")]
    pub comment_marker: String,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            comment_marker: default_comment_marker(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub repl: ReplSettings,
    #[serde(default)]
    pub script: ScriptSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.taubench/config.toml` file and
    /// load it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Persist a newly supplied executable path under `dir`, so the
    /// next run finds the interpreter without flags.
    pub fn save_executable(&mut self, dir: &Path, executable: &str) -> Result<PathBuf> {
        self.repl.executable = Some(executable.to_string());

        let config_dir = dir.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed to create {}", config_dir.display()))?;
        let path = config_dir.join(CONFIG_FILENAME);
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            args: self.repl.args.clone(),
            sentinel: self.repl.sentinel.clone(),
            probe_quiet: Duration::from_millis(self.repl.probe_quiet_millis),
            probe_deadline: Duration::from_secs(self.repl.probe_deadline_secs),
            buffer_limit: self.repl.buffer_limit_bytes,
            terminate_grace: Duration::from_millis(self.repl.terminate_grace_millis),
        }
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.repl.submit_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.script.step_timeout_secs)
    }
}

/// Resolve the REPL executable the way the workbench has always done:
/// explicit flag, then the config file, then a `tau`/`tau.exe` next to
/// the working directory. Candidates must exist as files.
pub fn resolve_executable(
    flag: Option<&str>,
    config: &ProjectConfig,
    cwd: &Path,
) -> Option<String> {
    if let Some(path) = flag {
        if Path::new(path).is_file() {
            return Some(path.to_string());
        }
    }
    if let Some(path) = config.repl.executable.as_deref() {
        if Path::new(path).is_file() {
            return Some(path.to_string());
        }
    }
    for candidate in ["tau", "tau.exe"] {
        let path = cwd.join(candidate);
        if path.is_file() {
            return Some(path.to_string_lossy().into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert!(config.repl.executable.is_none());
        assert!(config.repl.sentinel.is_none());
        assert_eq!(config.repl.submit_timeout_secs, 30);
        assert_eq!(config.repl.probe_quiet_millis, 300);
        assert_eq!(config.repl.buffer_limit_bytes, 256 * 1024);
        assert_eq!(config.repl.terminate_grace_millis, 2000);
        assert_eq!(config.script.comment_marker, "#");
        assert_eq!(config.script.step_timeout_secs, 10);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[repl]
executable = "/opt/tau/bin/tau"
args = ["--no-color"]
sentinel = "tau>"
submit_timeout_secs = 45
probe_quiet_millis = 500
probe_deadline_secs = 10
buffer_limit_bytes = 65536
terminate_grace_millis = 1000

[script]
comment_marker = "//"
step_timeout_secs = 20
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.repl.executable.as_deref(), Some("/opt/tau/bin/tau"));
        assert_eq!(config.repl.args, vec!["--no-color"]);
        assert_eq!(config.repl.sentinel.as_deref(), Some("tau>"));
        assert_eq!(config.repl.submit_timeout_secs, 45);
        assert_eq!(config.repl.buffer_limit_bytes, 65536);
        assert_eq!(config.script.comment_marker, "//");
        assert_eq!(config.script.step_timeout_secs, 20);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[repl]
executable = "./tau"
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.repl.executable.as_deref(), Some("./tau"));
        assert_eq!(config.repl.submit_timeout_secs, 30);
        assert_eq!(config.script.comment_marker, "#");
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert!(config.repl.executable.is_none());
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg_dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&cfg_dir).unwrap();
        fs::write(
            cfg_dir.join(CONFIG_FILENAME),
            r#"
[repl]
executable = "/usr/local/bin/tau"
"#,
        )
        .unwrap();

        let nested = tmp.path().join("examples").join("deep");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(
            config.repl.executable.as_deref(),
            Some("/usr/local/bin/tau")
        );
    }

    #[test]
    fn save_executable_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::default();
        let path = config
            .save_executable(tmp.path(), "/opt/tau/bin/tau")
            .unwrap();
        assert!(path.is_file());

        let (reloaded, found) = ProjectConfig::load(tmp.path()).unwrap();
        assert_eq!(found.as_deref(), Some(path.as_path()));
        assert_eq!(reloaded.repl.executable.as_deref(), Some("/opt/tau/bin/tau"));
    }

    #[test]
    fn resolve_prefers_flag_then_config_then_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let flag_bin = tmp.path().join("flag-tau");
        let config_bin = tmp.path().join("config-tau");
        let cwd_bin = tmp.path().join("tau");
        for p in [&flag_bin, &config_bin, &cwd_bin] {
            fs::write(p, "").unwrap();
        }

        let config = ProjectConfig {
            repl: ReplSettings {
                executable: Some(config_bin.to_string_lossy().into_owned()),
                ..ReplSettings::default()
            },
            ..ProjectConfig::default()
        };

        // Flag wins.
        let resolved = resolve_executable(
            Some(&flag_bin.to_string_lossy()),
            &config,
            tmp.path(),
        );
        assert_eq!(resolved.as_deref(), Some(&*flag_bin.to_string_lossy()));

        // Missing flag falls through to config.
        let resolved = resolve_executable(Some("/missing/tau"), &config, tmp.path());
        assert_eq!(resolved.as_deref(), Some(&*config_bin.to_string_lossy()));

        // No flag, no config: working-directory fallback.
        let resolved = resolve_executable(None, &ProjectConfig::default(), tmp.path());
        assert_eq!(resolved.as_deref(), Some(&*cwd_bin.to_string_lossy()));

        // Nothing anywhere.
        let empty = tempfile::tempdir().unwrap();
        assert!(resolve_executable(None, &ProjectConfig::default(), empty.path()).is_none());
    }
}
