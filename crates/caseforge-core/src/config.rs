use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CaseforgeError, Result};
use crate::types::ComplianceStandard;

/// Top-level caseforge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub quality: QualityThresholds,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-call timeout in seconds.
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.1 }
fn default_model_timeout() -> u64 { 120 }

/// Transport-level retry configuration for model requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_transport_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_transport_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_transport_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// What to do with a new run when `max_concurrent_sessions` are already active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for a slot.
    #[default]
    Queue,
    /// Fail immediately with `Busy`.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Retry bound per stage (MAX_RETRIES).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Save the record to the session store after every stage.
    #[serde(default = "default_checkpoint_each_stage")]
    pub checkpoint_each_stage: bool,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// Upper bound on in-flight model calls for one document batch.
    #[serde(default = "default_max_concurrent_documents")]
    pub max_concurrent_documents: usize,
    /// Largest text segment sent to the model in one call.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            checkpoint_each_stage: default_checkpoint_each_stage(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            overflow: OverflowPolicy::default(),
            max_concurrent_documents: default_max_concurrent_documents(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_checkpoint_each_stage() -> bool { true }
fn default_max_concurrent_sessions() -> usize { 4 }
fn default_max_concurrent_documents() -> usize { 5 }
fn default_max_input_chars() -> usize { 12_000 }

/// Minimum scores for `quality_passed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityThresholds {
    #[serde(default = "default_min_completeness")]
    pub min_completeness_score: f64,
    #[serde(default = "default_min_accuracy")]
    pub min_accuracy_score: f64,
    #[serde(default = "default_min_traceability")]
    pub min_traceability_score: f64,
    #[serde(default = "default_min_compliance")]
    pub min_compliance_score: f64,
    #[serde(default = "default_min_coverage")]
    pub min_coverage_percentage: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_completeness_score: default_min_completeness(),
            min_accuracy_score: default_min_accuracy(),
            min_traceability_score: default_min_traceability(),
            min_compliance_score: default_min_compliance(),
            min_coverage_percentage: default_min_coverage(),
        }
    }
}

fn default_min_completeness() -> f64 { 0.8 }
fn default_min_accuracy() -> f64 { 0.85 }
fn default_min_traceability() -> f64 { 0.9 }
fn default_min_compliance() -> f64 { 0.5 }
fn default_min_coverage() -> f64 { 80.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_true")]
    pub include_negative: bool,
    #[serde(default = "default_true")]
    pub include_boundary: bool,
    #[serde(default = "default_true")]
    pub include_security: bool,
    #[serde(default = "default_max_cases_per_requirement")]
    pub max_test_cases_per_requirement: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            include_negative: true,
            include_boundary: true,
            include_security: true,
            max_test_cases_per_requirement: default_max_cases_per_requirement(),
        }
    }
}

fn default_true() -> bool { true }
fn default_max_cases_per_requirement() -> usize { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Standards used when the caller does not request any.
    #[serde(default = "default_standards")]
    pub default_standards: Vec<ComplianceStandard>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            default_standards: default_standards(),
        }
    }
}

fn default_standards() -> Vec<ComplianceStandard> {
    ComplianceStandard::ALL.to_vec()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Sessions idle longer than this are evicted by cleanup (SESSION_TIMEOUT_MINUTES).
    #[serde(default = "default_session_timeout")]
    pub timeout_minutes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_db_path(),
            timeout_minutes: default_session_timeout(),
        }
    }
}

fn default_db_path() -> String { "~/.caseforge/sessions.db".to_string() }
fn default_session_timeout() -> u64 { 60 }

/// JSONL run-log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.caseforge/logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl AppConfig {
    /// Minimal config for the given model, all other sections defaulted.
    pub fn for_model(provider: &str, model_id: &str) -> Self {
        Self {
            model: ModelConfig {
                provider: provider.to_string(),
                model_id: model_id.to_string(),
                api_key: None,
                base_url: None,
                max_tokens: default_max_tokens(),
                temperature: default_temperature(),
                timeout_secs: default_model_timeout(),
                retry: None,
            },
            fallback_models: vec![],
            workflow: WorkflowConfig::default(),
            quality: QualityThresholds::default(),
            generation: GenerationConfig::default(),
            compliance: ComplianceConfig::default(),
            session: SessionConfig::default(),
            log: None,
        }
    }

    /// Load config from a TOML file, with env var expansion and overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CaseforgeError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let mut config: AppConfig =
            toml::from_str(&expanded).map_err(|e| CaseforgeError::Config(e.to_string()))?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the documented environment overrides (MAX_RETRIES, MIN_*_SCORE, ...).
    ///
    /// `lookup` abstracts the environment so tests need not mutate process state.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "MAX_RETRIES", &mut self.workflow.max_retries)?;
        override_from(
            &lookup,
            "MAX_CONCURRENT_DOCUMENTS",
            &mut self.workflow.max_concurrent_documents,
        )?;
        override_from(
            &lookup,
            "MAX_CONCURRENT_SESSIONS",
            &mut self.workflow.max_concurrent_sessions,
        )?;
        override_from(
            &lookup,
            "MIN_COMPLETENESS_SCORE",
            &mut self.quality.min_completeness_score,
        )?;
        override_from(&lookup, "MIN_ACCURACY_SCORE", &mut self.quality.min_accuracy_score)?;
        override_from(
            &lookup,
            "MIN_TRACEABILITY_SCORE",
            &mut self.quality.min_traceability_score,
        )?;
        override_from(
            &lookup,
            "MIN_COMPLIANCE_SCORE",
            &mut self.quality.min_compliance_score,
        )?;
        override_from(
            &lookup,
            "MIN_COVERAGE_PERCENTAGE",
            &mut self.quality.min_coverage_percentage,
        )?;
        override_from(
            &lookup,
            "SESSION_TIMEOUT_MINUTES",
            &mut self.session.timeout_minutes,
        )?;
        Ok(())
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.model.max_tokens == 0 {
            return Err(CaseforgeError::Config("model.max_tokens must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.model.temperature) {
            return Err(CaseforgeError::Config(
                "model.temperature must be between 0.0 and 1.0".into(),
            ));
        }
        let q = &self.quality;
        for (name, value) in [
            ("min_completeness_score", q.min_completeness_score),
            ("min_accuracy_score", q.min_accuracy_score),
            ("min_traceability_score", q.min_traceability_score),
            ("min_compliance_score", q.min_compliance_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CaseforgeError::Config(format!(
                    "quality.{} must be between 0.0 and 1.0 (got {})",
                    name, value
                )));
            }
        }
        if !(0.0..=100.0).contains(&q.min_coverage_percentage) {
            return Err(CaseforgeError::Config(
                "quality.min_coverage_percentage must be between 0 and 100".into(),
            ));
        }
        if self.workflow.max_concurrent_sessions == 0 || self.workflow.max_concurrent_documents == 0
        {
            return Err(CaseforgeError::Config(
                "workflow concurrency limits must be at least 1".into(),
            ));
        }
        if self.workflow.max_input_chars < 256 {
            return Err(CaseforgeError::Config(
                "workflow.max_input_chars must be at least 256".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the session database path (expand ~).
    pub fn session_db_path(&self) -> PathBuf {
        expand_home(&self.session.db_path)
    }

    /// Resolve the run-log directory, if logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(expand_home(
            log.log_dir.as_deref().unwrap_or("~/.caseforge/logs"),
        ))
    }
}

fn override_from<T, F>(lookup: &F, name: &str, slot: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| CaseforgeError::Config(format!("{} has invalid value '{}'", name, raw)))?;
    }
    Ok(())
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
