//! Configuration for supervisor workflows
//!
//! [`SupervisorConfig`] gathers every routing option in one struct. It can be
//! built in code, or read from JSON:
//!
//! ```
//! use tower_supervisor::config::{OutputMode, SupervisorConfig};
//!
//! let config = SupervisorConfig::from_json_str(r#"{"output_mode": "full_history"}"#).unwrap();
//! assert_eq!(config.output_mode, OutputMode::FullHistory);
//! assert!(config.add_handoff_back_messages);
//! ```
//!
//! [`load_env`] populates the process environment from `.env.json` or `.env`.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::agent::DEFAULT_MAX_STEPS;
use crate::error::{Result, SupervisorError};
use crate::graph::DEFAULT_RECURSION_LIMIT;

/// How much of a worker's output goes back into the shared history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputMode {
    /// Every message the worker returned
    FullHistory,
    /// Only the worker's final message
    #[default]
    LastMessage,
}

impl OutputMode {
    pub const ALLOWED: &'static [&'static str] = &["full_history", "last_message"];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::FullHistory => "full_history",
            OutputMode::LastMessage => "last_message",
        }
    }
}

impl FromStr for OutputMode {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full_history" => Ok(OutputMode::FullHistory),
            "last_message" => Ok(OutputMode::LastMessage),
            other => Err(SupervisorError::InvalidOutputMode {
                value: other.to_string(),
                allowed: Self::ALLOWED,
            }),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for OutputMode {
    type Error = SupervisorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OutputMode> for String {
    fn from(value: OutputMode) -> Self {
        value.as_str().to_string()
    }
}

/// How agent names are exposed to the supervisor model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AgentNameMode {
    /// `<name>..</name><content>..</content>` tags in the message text
    Inline,
}

impl AgentNameMode {
    pub const ALLOWED: &'static [&'static str] = &["inline"];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentNameMode::Inline => "inline",
        }
    }
}

impl FromStr for AgentNameMode {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inline" => Ok(AgentNameMode::Inline),
            other => Err(SupervisorError::InvalidAgentNameMode {
                value: other.to_string(),
                allowed: Self::ALLOWED,
            }),
        }
    }
}

impl fmt::Display for AgentNameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for AgentNameMode {
    type Error = SupervisorError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AgentNameMode> for String {
    fn from(value: AgentNameMode) -> Self {
        value.as_str().to_string()
    }
}

/// Supervisor routing options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Worker output kept in the shared history
    pub output_mode: OutputMode,

    /// Append a synthetic transfer-back pair after each worker turn
    pub add_handoff_back_messages: bool,

    /// `None` relies on the provider's native `name` field
    pub include_agent_name: Option<AgentNameMode>,

    /// Allow several tool calls per supervisor turn
    pub parallel_tool_calls: bool,

    /// Node name of the supervisor
    pub supervisor_name: String,

    /// Maximum node executions per graph run
    pub recursion_limit: usize,

    /// Maximum model turns per agent run
    pub max_agent_steps: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            output_mode: OutputMode::LastMessage,
            add_handoff_back_messages: true,
            include_agent_name: None,
            parallel_tool_calls: false,
            supervisor_name: "supervisor".to_string(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            max_agent_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl SupervisorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    pub fn add_handoff_back_messages(mut self, enabled: bool) -> Self {
        self.add_handoff_back_messages = enabled;
        self
    }

    pub fn include_agent_name(mut self, mode: AgentNameMode) -> Self {
        self.include_agent_name = Some(mode);
        self
    }

    pub fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = enabled;
        self
    }

    pub fn supervisor_name(mut self, name: impl Into<String>) -> Self {
        self.supervisor_name = name.into();
        self
    }

    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn max_agent_steps(mut self, max: usize) -> Self {
        self.max_agent_steps = max;
        self
    }
}

/// Which file [`load_env`] read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvSource {
    Json(PathBuf),
    DotEnv(PathBuf),
    /// Neither file exists; the environment is untouched
    Process,
}

/// Load variables from `<root>/.env.json`, else `<root>/.env`.
///
/// `.env.json` must hold a flat object; non-string values are stringified
/// and `null` becomes the empty string. Unless `override_existing` is set,
/// variables that already have a non-empty value are kept.
pub fn load_env(root: impl AsRef<Path>, override_existing: bool) -> Result<EnvSource> {
    let root = root.as_ref();

    let json_path = root.join(".env.json");
    if json_path.exists() {
        let data: Value = serde_json::from_str(&fs::read_to_string(&json_path)?)?;
        if let Value::Object(map) = data {
            for (key, value) in map {
                let value = match value {
                    Value::Null => String::new(),
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let present = env::var(&key).map(|v| !v.is_empty()).unwrap_or(false);
                if override_existing || !present {
                    env::set_var(&key, value);
                }
            }
        }
        debug!(path = %json_path.display(), "loaded environment from json");
        return Ok(EnvSource::Json(json_path));
    }

    let dotenv_path = root.join(".env");
    if dotenv_path.exists() {
        if override_existing {
            for item in dotenv::from_path_iter(&dotenv_path)? {
                let (key, value) = item?;
                env::set_var(key, value);
            }
        } else {
            dotenv::from_path(&dotenv_path)?;
        }
        debug!(path = %dotenv_path.display(), "loaded environment from .env");
        return Ok(EnvSource::DotEnv(dotenv_path));
    }

    Ok(EnvSource::Process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.output_mode, OutputMode::LastMessage);
        assert!(config.add_handoff_back_messages);
        assert_eq!(config.include_agent_name, None);
        assert!(!config.parallel_tool_calls);
        assert_eq!(config.supervisor_name, "supervisor");
        assert_eq!(config.recursion_limit, 25);
        assert_eq!(config.max_agent_steps, 25);
    }

    #[test]
    fn parses_modes() {
        assert_eq!("full_history".parse::<OutputMode>().unwrap(), OutputMode::FullHistory);
        assert_eq!(OutputMode::LastMessage.to_string(), "last_message");
        assert_eq!("inline".parse::<AgentNameMode>().unwrap(), AgentNameMode::Inline);

        let err = "everything".parse::<OutputMode>().unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidOutputMode { ref value, .. } if value == "everything"));
        assert!(err.to_string().contains("last_message"));

        let err = "xml".parse::<AgentNameMode>().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn json_round_trip() {
        let config = SupervisorConfig::default()
            .output_mode(OutputMode::FullHistory)
            .include_agent_name(AgentNameMode::Inline)
            .supervisor_name("router");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""output_mode":"full_history""#));
        assert!(json.contains(r#""include_agent_name":"inline""#));
        assert_eq!(SupervisorConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn unknown_mode_in_json_names_value() {
        let err = SupervisorConfig::from_json_str(r#"{"output_mode": "summary"}"#).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("summary"));
        assert!(text.contains("full_history"));
    }

    #[test]
    fn from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        fs::write(&path, r#"{"add_handoff_back_messages": false, "recursion_limit": 7}"#).unwrap();

        let config = SupervisorConfig::from_path(&path).unwrap();
        assert!(!config.add_handoff_back_messages);
        assert_eq!(config.recursion_limit, 7);
        assert!(matches!(
            SupervisorConfig::from_path(dir.path().join("missing.json")),
            Err(SupervisorError::Io(_))
        ));
    }

    #[test]
    fn env_json_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".env.json"),
            r#"{"TS_CFG_JSON_KEY": "from-json", "TS_CFG_JSON_NUM": 3, "TS_CFG_JSON_NULL": null}"#,
        )
        .unwrap();
        fs::write(dir.path().join(".env"), "TS_CFG_JSON_KEY=from-dotenv\n").unwrap();

        let source = load_env(dir.path(), true).unwrap();
        assert_eq!(source, EnvSource::Json(dir.path().join(".env.json")));
        assert_eq!(env::var("TS_CFG_JSON_KEY").unwrap(), "from-json");
        assert_eq!(env::var("TS_CFG_JSON_NUM").unwrap(), "3");
        assert_eq!(env::var("TS_CFG_JSON_NULL").unwrap(), "");
    }

    #[test]
    fn dotenv_fallback_respects_override_flag() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".env"), "TS_CFG_DOTENV_KEY=from-file\n").unwrap();
        env::set_var("TS_CFG_DOTENV_KEY", "preset");

        assert_eq!(
            load_env(dir.path(), false).unwrap(),
            EnvSource::DotEnv(dir.path().join(".env"))
        );
        assert_eq!(env::var("TS_CFG_DOTENV_KEY").unwrap(), "preset");

        load_env(dir.path(), true).unwrap();
        assert_eq!(env::var("TS_CFG_DOTENV_KEY").unwrap(), "from-file");
    }

    #[test]
    fn no_files_leaves_environment() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_env(dir.path(), true).unwrap(), EnvSource::Process);
    }
}
