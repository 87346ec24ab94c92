//! Configuration loaded from `.bugsniper/bugsniper.toml`.
//!
//! Settings are layered: file, then environment, then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [generator]
//! provider = "command"          # command | gemini | mock
//! command = "claude"
//! args = ["--print"]
//! model = "gemini-1.5-flash"
//! timeout_secs = 300
//! max_files = 5
//! max_file_chars = 2000
//!
//! [tests]
//! runner = "pytest"
//! version_timeout_secs = 10
//! collect_timeout_secs = 60
//! run_timeout_secs = 120
//! task_timeout_secs = 300
//! max_diagnostics = 20
//! mock = false
//! validate_patches = true
//!
//! [workspace]
//! root = "/tmp/bugsniper"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8090
//! db_path = ".bugsniper/jobs.db"
//!
//! [logging]
//! format = "text"               # text | json
//! ```
//!
//! Environment overrides: `BUGSNIPER_GENERATOR`, `BUGSNIPER_GENERATOR_CMD`,
//! `GEMINI_API_KEY`, `BUGSNIPER_TEST_MOCK`, `BUGSNIPER_DB`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::analysis::prompt::PromptLimits;

pub const CONFIG_DIR: &str = ".bugsniper";
pub const CONFIG_FILE: &str = "bugsniper.toml";

/// Which backend produces analysis text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorProvider {
    /// Local CLI fed on stdin
    #[default]
    Command,
    /// Gemini REST API
    Gemini,
    /// Offline canned responses
    Mock,
}

impl std::str::FromStr for GeneratorProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" | "cli" => Ok(Self::Command),
            "gemini" => Ok(Self::Gemini),
            "mock" => Ok(Self::Mock),
            _ => Err(format!(
                "Invalid generator provider: {}. Valid options: command, gemini, mock",
                s
            )),
        }
    }
}

impl std::fmt::Display for GeneratorProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Gemini => write!(f, "gemini"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `[generator]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorSection {
    #[serde(default)]
    pub provider: GeneratorProvider,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_generator_args")]
    pub args: Vec<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Prefer `GEMINI_API_KEY` over storing the key in the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_file_chars")]
    pub max_file_chars: usize,
}

fn default_generator_args() -> Vec<String> {
    vec!["--print".to_string()]
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_generator_timeout() -> u64 {
    300
}

fn default_max_files() -> usize {
    5
}

fn default_max_file_chars() -> usize {
    2000
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            provider: GeneratorProvider::default(),
            command: None,
            args: default_generator_args(),
            model: default_model(),
            api_key: None,
            timeout_secs: default_generator_timeout(),
            max_files: default_max_files(),
            max_file_chars: default_max_file_chars(),
        }
    }
}

impl GeneratorSection {
    pub fn provider(&self) -> GeneratorProvider {
        self.provider
    }

    pub fn command(&self) -> String {
        self.command.clone().unwrap_or_else(|| "claude".to_string())
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key.clone().filter(|k| !k.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn prompt_limits(&self) -> PromptLimits {
        PromptLimits {
            max_files: self.max_files,
            max_file_chars: self.max_file_chars,
            ..PromptLimits::default()
        }
    }
}

/// `[tests]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestsSection {
    #[serde(default = "default_runner")]
    pub runner: String,
    #[serde(default = "default_version_timeout")]
    pub version_timeout_secs: u64,
    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_secs: u64,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    /// Upper bound for the whole test task, all tiers included.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_diagnostics")]
    pub max_diagnostics: usize,
    /// Skip the runner and use static heuristics only.
    #[serde(default)]
    pub mock: bool,
    #[serde(default = "default_validate_patches")]
    pub validate_patches: bool,
}

fn default_runner() -> String {
    "pytest".to_string()
}

fn default_version_timeout() -> u64 {
    10
}

fn default_collect_timeout() -> u64 {
    60
}

fn default_run_timeout() -> u64 {
    120
}

fn default_task_timeout() -> u64 {
    300
}

fn default_max_diagnostics() -> usize {
    20
}

fn default_validate_patches() -> bool {
    true
}

impl Default for TestsSection {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            version_timeout_secs: default_version_timeout(),
            collect_timeout_secs: default_collect_timeout(),
            run_timeout_secs: default_run_timeout(),
            task_timeout_secs: default_task_timeout(),
            max_diagnostics: default_max_diagnostics(),
            mock: false,
            validate_patches: default_validate_patches(),
        }
    }
}

impl TestsSection {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// `[workspace]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSection {
    /// Parent directory for per-job working copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

impl WorkspaceSection {
    pub fn root(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("bugsniper"))
    }
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub dev_mode: bool,
    /// Relative paths resolve against the project directory.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("jobs.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
            db_path: default_db_path(),
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Root of `bugsniper.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BugsniperToml {
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub tests: TestsSection,
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

fn env_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl BugsniperToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse bugsniper.toml")
    }

    /// Load `<config_dir>/bugsniper.toml`, or defaults when it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize bugsniper.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides using `lookup` (normally `std::env::var`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(provider) = lookup("BUGSNIPER_GENERATOR") {
            match provider.parse() {
                Ok(p) => self.generator.provider = p,
                Err(e) => warnings.push(e),
            }
        }
        if let Some(cmd) = lookup("BUGSNIPER_GENERATOR_CMD").filter(|c| !c.trim().is_empty()) {
            self.generator.command = Some(cmd);
        }
        if let Some(key) = lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.generator.api_key = Some(key);
        }
        if let Some(mock) = lookup("BUGSNIPER_TEST_MOCK") {
            self.tests.mock = env_flag(&mock);
        }
        if let Some(db) = lookup("BUGSNIPER_DB").filter(|d| !d.trim().is_empty()) {
            self.server.db_path = PathBuf::from(db);
        }

        warnings
    }

    /// Check the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.generator.provider == GeneratorProvider::Gemini && self.generator.api_key().is_none()
        {
            warnings.push(
                "generator.provider is 'gemini' but no API key is set (GEMINI_API_KEY)".to_string(),
            );
        }
        if self.generator.timeout_secs == 0 {
            warnings.push("generator.timeout_secs is 0: every analysis will time out".to_string());
        }
        if self.generator.max_files == 0 {
            warnings.push("generator.max_files is 0: the prompt will contain no source".to_string());
        }
        if self.tests.runner.trim().is_empty() {
            warnings.push("tests.runner is empty: only static heuristics will run".to_string());
        }
        if self.tests.task_timeout_secs == 0 {
            warnings.push("tests.task_timeout_secs is 0: every test task will time out".to_string());
        }
        if self.tests.task_timeout_secs < self.tests.run_timeout_secs {
            warnings.push(format!(
                "tests.task_timeout_secs ({}) is shorter than tests.run_timeout_secs ({})",
                self.tests.task_timeout_secs, self.tests.run_timeout_secs
            ));
        }
        if self.server.port == 0 {
            warnings.push("server.port is 0: an ephemeral port will be used".to_string());
        }

        warnings
    }
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct BugsniperConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: BugsniperToml,
    pub verbose: bool,
    /// Warnings produced while applying environment overrides.
    pub env_warnings: Vec<String>,
}

impl BugsniperConfig {
    /// Load from `<project_dir>/.bugsniper/bugsniper.toml` (or `config_file`
    /// when given) and apply the process environment.
    pub fn new(project_dir: PathBuf, config_file: Option<PathBuf>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory {}", project_dir.display()))?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = match config_file {
            Some(path) => BugsniperToml::load(&path)?,
            None => BugsniperToml::load_or_default(&config_dir)?,
        };
        let env_warnings = toml.apply_overrides(|key| std::env::var(key).ok());

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            verbose: false,
            env_warnings,
        })
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        let path = &self.toml.server.db_path;
        if path.is_absolute() {
            path.clone()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.env_warnings.clone();
        warnings.extend(self.toml.validate());
        warnings
    }
}
