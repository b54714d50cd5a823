//! Advisor configuration schema.
//!
//! One YAML file describes the policy checkpoint, the reward hyperparameters, the transport
//! the compiler talks to, and where logs go. The loaded value is immutable and handed to each
//! component by reference.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ACTION_SPACE_SIZE, STATE_SIZE};

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Trained policy location and shape.
    pub policy: PolicyConfig,
    /// Target architecture the compiler is generating code for.
    #[serde(default)]
    pub target: TargetArch,
    /// Reward shaping hyperparameters.
    #[serde(default)]
    pub reward: RewardConfig,
    /// How the compiler reaches the advisor.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Optional one-shot export of the policy graph at startup.
    #[serde(default)]
    pub export: ExportConfig,
    /// Completion log and event log locations.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Policy checkpoint + architecture.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Checkpoint file, or a directory containing `policy.safetensors`.
    pub checkpoint: PathBuf,
    /// Length of the state vector fed to the policy.
    #[serde(default = "default_state_size")]
    pub state_size: usize,
    /// Number of discrete actions.
    #[serde(default = "default_action_space_size")]
    pub action_space_size: usize,
    /// Hidden layer widths of the Q-network.
    #[serde(default = "default_hidden")]
    pub hidden: Vec<usize>,
}

fn default_state_size() -> usize {
    STATE_SIZE
}

fn default_action_space_size() -> usize {
    ACTION_SPACE_SIZE
}

fn default_hidden() -> Vec<usize> {
    vec![64, 64]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetArch {
    #[default]
    X86,
    AArch64,
}

impl TargetArch {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetArch::X86 => "X86",
            TargetArch::AArch64 => "AArch64",
        }
    }
}

/// Reward shaping hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RewardConfig {
    /// Weight of the code-size term.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Weight of the throughput (machine code analyzer) term.
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Relative size changes smaller than this contribute nothing.
    #[serde(default = "default_reward_thresh")]
    pub size_reward_thresh: f64,
    /// Relative throughput changes smaller than this contribute nothing.
    #[serde(default = "default_reward_thresh")]
    pub mca_reward_thresh: f64,
}

fn default_alpha() -> f64 {
    10.0
}

fn default_beta() -> f64 {
    5.0
}

fn default_reward_thresh() -> f64 {
    0.2
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            beta: default_beta(),
            size_reward_thresh: default_reward_thresh(),
            mca_reward_thresh: default_reward_thresh(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// One long-lived duplex channel, repeated reset/step turns.
    #[default]
    Pipe,
    /// Discrete `getAdvice` calls over a socket, session state held by the advisor.
    Remote,
}

impl TransportMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportMode::Pipe => "pipe",
            TransportMode::Remote => "remote",
        }
    }
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipe" => Ok(TransportMode::Pipe),
            "remote" | "grpc" => Ok(TransportMode::Remote),
            other => Err(ConfigError::Invalid(format!("unknown transport mode: {other}"))),
        }
    }
}

/// Payload encoding inside each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Readable text (JSON).
    #[default]
    Json,
    /// Compact little-endian binary layout.
    Binary,
    /// MessagePack, for peers in other languages.
    MsgPack,
}

impl FromStr for Encoding {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Encoding::Json),
            "binary" | "bytes" => Ok(Encoding::Binary),
            "msgpack" => Ok(Encoding::MsgPack),
            other => Err(ConfigError::Invalid(format!("unknown encoding: {other}"))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Encoding::Json => "json",
            Encoding::Binary => "binary",
            Encoding::MsgPack => "msgpack",
        })
    }
}

/// Transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub mode: TransportMode,
    #[serde(default)]
    pub encoding: Encoding,
    /// Base name of the named pipe pair (`<name>.in` / `<name>.out`).
    #[serde(default = "default_pipe_name")]
    pub pipe_name: String,
    /// Directory holding the named pipes.
    #[serde(default = "default_pipe_dir")]
    pub pipe_dir: PathBuf,
    /// If set, spawn this compiler command and talk to it over stdin/stdout instead of pipes.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// Remote-call bind address (`tcp://host:port` or `unix:///path.sock`).
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_pipe_name() -> String {
    "posetrl_pipe".to_string()
}

fn default_pipe_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_bind() -> String {
    "tcp://127.0.0.1:50051".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            encoding: Encoding::default(),
            pipe_name: default_pipe_name(),
            pipe_dir: default_pipe_dir(),
            command: None,
            bind: default_bind(),
        }
    }
}

/// Parsed remote-call address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            if rest.is_empty() {
                return Err(ConfigError::Invalid("empty tcp address".to_string()));
            }
            return Ok(Endpoint::Tcp(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(ConfigError::Invalid("empty unix socket path".to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(rest)));
        }
        // A bare port is accepted for parity with `--server_port 50051`.
        if s.parse::<u16>().is_ok() {
            return Ok(Endpoint::Tcp(format!("127.0.0.1:{s}")));
        }
        Err(ConfigError::Invalid(format!("unsupported bind address: {s}")))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(a) => write!(f, "tcp://{a}"),
            Endpoint::Unix(p) => write!(f, "unix://{}", p.display()),
        }
    }
}

/// Portable graph export settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_export_path")]
    pub path: PathBuf,
}

fn default_export_path() -> PathBuf {
    PathBuf::from("posetrl_model.po-graph")
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_export_path(),
        }
    }
}

/// Log file locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// One line per completed episode (the compilation unit id).
    #[serde(default = "default_completion_log")]
    pub completion_log: PathBuf,
    /// Optional NDJSON lifecycle events.
    #[serde(default)]
    pub events_path: Option<PathBuf>,
    /// Flush the event log every N lines (0 flushes only on drop).
    #[serde(default = "default_flush_every_lines")]
    pub flush_every_lines: u64,
}

fn default_completion_log() -> PathBuf {
    PathBuf::from("actionlist.txt")
}

fn default_flush_every_lines() -> u64 {
    1
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            completion_log: default_completion_log(),
            events_path: None,
            flush_every_lines: default_flush_every_lines(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration pointing at the given checkpoint.
    pub fn with_checkpoint(checkpoint: impl Into<PathBuf>) -> Self {
        Self {
            policy: PolicyConfig {
                checkpoint: checkpoint.into(),
                state_size: default_state_size(),
                action_space_size: default_action_space_size(),
                hidden: default_hidden(),
            },
            target: TargetArch::default(),
            reward: RewardConfig::default(),
            transport: TransportConfig::default(),
            export: ExportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.state_size == 0 {
            return Err(ConfigError::Invalid("policy.state_size must be > 0".to_string()));
        }
        if self.policy.action_space_size == 0 {
            return Err(ConfigError::Invalid(
                "policy.action_space_size must be > 0".to_string(),
            ));
        }
        if i32::try_from(self.policy.action_space_size).is_err() {
            return Err(ConfigError::Invalid(
                "policy.action_space_size does not fit the wire format".to_string(),
            ));
        }
        if self.policy.hidden.iter().any(|&h| h == 0) {
            return Err(ConfigError::Invalid("policy.hidden widths must be > 0".to_string()));
        }
        let r = &self.reward;
        for (name, v) in [
            ("alpha", r.alpha),
            ("beta", r.beta),
            ("size_reward_thresh", r.size_reward_thresh),
            ("mca_reward_thresh", r.mca_reward_thresh),
        ] {
            if !v.is_finite() {
                return Err(ConfigError::Invalid(format!("reward.{name} must be finite")));
            }
        }
        if self.transport.mode == TransportMode::Remote {
            self.endpoint()?;
        }
        if let Some(cmd) = &self.transport.command {
            if cmd.is_empty() {
                return Err(ConfigError::Invalid("transport.command must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Parsed remote-call bind address.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        self.transport.bind.parse()
    }
}
