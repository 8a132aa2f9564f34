//! Runtime configuration loading and validation.
//!
//! Reads `parley.yaml` and resolves environment variables. The file is the
//! single source of truth for the model endpoint, personas, conversation
//! limits, delimiter grammars and background maintenance cadence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::agent_core::segmenter::{validate_grammars, DelimiterSpec, GrammarKind};
use crate::inference::errors::InferenceError;

/// Config file name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "parley.yaml";

/// Persona every other persona is merged onto.
pub const DEFAULT_PERSONA: &str = "default";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Model endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A persona as written in the file. Unset fields inherit from `default`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonaOverlay {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub traits: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub voice: Option<String>,
}

/// A fully resolved persona.
#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    pub name: String,
    pub description: String,
    pub traits: Vec<String>,
    pub model: String,
    pub temperature: f32,
    /// Voice name for speech synthesis; `None` disables audio.
    pub voice: Option<String>,
}

impl Persona {
    /// Base system prompt: description followed by one `- trait` line each.
    pub fn system_content(&self) -> String {
        let mut content = self.description.clone();
        for t in &self.traits {
            content.push_str("\n- ");
            content.push_str(t);
        }
        content
    }
}

/// Limits and grammars for a single conversation turn.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSettings {
    /// Maximum generate → dispatch rounds per request.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    /// Appended to the output when the round bound is exhausted.
    #[serde(default = "default_filler")]
    pub filler: String,
    /// Forward reasoning captures to the caller instead of dropping them.
    #[serde(default)]
    pub keep_reasoning: bool,
    /// Minimum buffered characters before a sentence is sent to synthesis.
    #[serde(default = "default_voice_min_chars")]
    pub voice_min_chars: usize,
    #[serde(default = "default_grammars")]
    pub grammars: Vec<DelimiterSpec>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            filler: default_filler(),
            keep_reasoning: false,
            voice_min_chars: default_voice_min_chars(),
            grammars: default_grammars(),
        }
    }
}

impl ConversationSettings {
    /// The first tool grammar; its markers are the ones advertised to the model.
    pub fn tool_grammar(&self) -> Option<&DelimiterSpec> {
        self.grammars.iter().find(|g| g.kind == GrammarKind::Tool)
    }
}

fn default_max_rounds() -> usize {
    3
}
fn default_filler() -> String {
    "...".to_string()
}
fn default_voice_min_chars() -> usize {
    128
}
fn default_grammars() -> Vec<DelimiterSpec> {
    vec![DelimiterSpec::reasoning(), DelimiterSpec::tool_code()]
}

/// Background memory compaction and log indexing.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceSettings {
    #[serde(default = "default_interval_secs")]
    pub memory_interval_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub index_interval_secs: u64,
    /// Model used for summaries and term extraction; defaults to the
    /// `default` persona's model.
    #[serde(default)]
    pub summarizer_model: Option<String>,
    #[serde(default = "default_summarizer_temperature")]
    pub summarizer_temperature: f32,
    /// Upper bound on index terms per exchange.
    #[serde(default = "default_max_terms")]
    pub max_terms: usize,
    /// SQLite file for notes and the term index; defaults to the data dir.
    #[serde(default)]
    pub database_path: Option<String>,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            memory_interval_secs: default_interval_secs(),
            index_interval_secs: default_interval_secs(),
            summarizer_model: None,
            summarizer_temperature: default_summarizer_temperature(),
            max_terms: default_max_terms(),
            database_path: None,
        }
    }
}

impl MaintenanceSettings {
    pub fn memory_interval(&self) -> Duration {
        Duration::from_secs(self.memory_interval_secs)
    }

    pub fn index_interval(&self) -> Duration {
        Duration::from_secs(self.index_interval_secs)
    }
}

fn default_interval_secs() -> u64 {
    30
}
fn default_summarizer_temperature() -> f32 {
    0.2
}
fn default_max_terms() -> usize {
    5
}

/// Top-level runtime configuration (mirrors `parley.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub endpoint: EndpointConfig,
    pub personas: HashMap<String, PersonaOverlay>,
    #[serde(default)]
    pub conversation: ConversationSettings,
    #[serde(default)]
    pub maintenance: MaintenanceSettings,
}

impl RuntimeConfig {
    /// Resolve `name`, filling unset fields from the `default` persona.
    pub fn persona(&self, name: &str) -> Result<Persona, InferenceError> {
        let base = self.personas.get(DEFAULT_PERSONA).ok_or_else(|| {
            InferenceError::ConfigError {
                reason: format!("persona '{DEFAULT_PERSONA}' is required"),
            }
        })?;
        let overlay = if name == DEFAULT_PERSONA {
            base
        } else {
            self.personas
                .get(name)
                .ok_or_else(|| InferenceError::ConfigError {
                    reason: format!("unknown persona '{name}'"),
                })?
        };

        let model = overlay
            .model
            .clone()
            .or_else(|| base.model.clone())
            .ok_or_else(|| InferenceError::ConfigError {
                reason: format!("persona '{name}' has no model"),
            })?;

        Ok(Persona {
            name: name.to_string(),
            description: overlay
                .description
                .clone()
                .or_else(|| base.description.clone())
                .unwrap_or_default(),
            traits: overlay
                .traits
                .clone()
                .or_else(|| base.traits.clone())
                .unwrap_or_default(),
            model,
            temperature: overlay.temperature.or(base.temperature).unwrap_or(0.7),
            voice: overlay.voice.clone().or_else(|| base.voice.clone()),
        })
    }

    /// Model used by the maintenance summarizer.
    pub fn summarizer_model(&self) -> Result<String, InferenceError> {
        match &self.maintenance.summarizer_model {
            Some(model) => Ok(model.clone()),
            None => Ok(self.persona(DEFAULT_PERSONA)?.model),
        }
    }

    /// Check cross-field invariants serde cannot express.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let invalid = |reason: String| InferenceError::ConfigError { reason };

        for name in self.personas.keys() {
            self.persona(name)?;
        }
        self.persona(DEFAULT_PERSONA)?;

        let conv = &self.conversation;
        if conv.max_rounds == 0 {
            return Err(invalid("conversation.max_rounds must be at least 1".into()));
        }
        validate_grammars(&conv.grammars).map_err(|e| invalid(e.to_string()))?;
        if conv.tool_grammar().is_none() {
            return Err(invalid("at least one tool grammar is required".into()));
        }
        let reasoning = conv
            .grammars
            .iter()
            .filter(|g| g.kind == GrammarKind::Reasoning)
            .count();
        if reasoning > 1 {
            return Err(invalid("at most one reasoning grammar is allowed".into()));
        }

        let maint = &self.maintenance;
        if maint.memory_interval_secs == 0 || maint.index_interval_secs == 0 {
            return Err(invalid("maintenance intervals must be > 0".into()));
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate `parley.yaml`.
///
/// Checks `PARLEY_CONFIG_DIR` first, then searches upward from `start`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(dir) = std::env::var("PARLEY_CONFIG_DIR") {
        let candidate = PathBuf::from(expand_tilde(&dir)).join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load, interpolate, parse and validate the configuration file.
///
/// String values may use `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_config(path: &Path) -> Result<RuntimeConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse configuration text (after env interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<RuntimeConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    let config: RuntimeConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
