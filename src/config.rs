use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("identitySystem.patient.rules must not be empty")]
    EmptyIdentityRules,
    #[error("unknown preprocessor id '{0}' referenced at {1}")]
    UnknownPreprocessor(String, String),
    #[error("environment variable {0} is not valid unicode")]
    InvalidEnv(String),
}

/// A single identifier-matching rule against a PID-3 repeat, or a fallback
/// MPI lookup. See spec §4.5.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MatchRule {
    #[serde(default)]
    pub assigner: Option<String>,
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub any: bool,
    #[serde(default)]
    pub mpi_lookup: Option<MpiLookupRule>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MpiLookupRule {
    pub system: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IdentitySystemConfig {
    pub patient: PatientIdentityConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PatientIdentityConfig {
    pub rules: Vec<MatchRule>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConverterConfig {
    #[serde(default)]
    pub pv1: Pv1Config,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Pv1Config {
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MessageConfig {
    /// (segment, field) -> preprocessor ids, e.g. `preprocess.PID.3 = ["pid2-to-pid3"]`.
    #[serde(default)]
    pub preprocess: HashMap<String, HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub converter: ConverterConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub identity_system: IdentitySystemConfig,
    #[serde(default)]
    pub messages: HashMap<String, MessageConfig>,
    /// Legacy task-code aliases (spec §9c). Closed, config-driven, not logic.
    #[serde(default)]
    pub task_code_aliases: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub raw: RawConfig,
    pub mllp_port: u16,
    pub fhir_base_url: String,
    pub fhir_app: String,
    pub fhir_fac: String,
    pub billing_app: String,
    pub billing_fac: String,
    pub polling_interval_secs: u64,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            raw: RawConfig::default(),
            mllp_port: 2575,
            fhir_base_url: "http://localhost:8080/fhir".to_string(),
            fhir_app: "FHIR_APP".to_string(),
            fhir_fac: "FHIR_FAC".to_string(),
            billing_app: "BILLING_APP".to_string(),
            billing_fac: "BILLING_FAC".to_string(),
            polling_interval_secs: 60,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = env::var("HL7V2_TO_FHIR_CONFIG")
            .unwrap_or_else(|_| "./config/hl7v2-to-fhir.json".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::default().separator("__"));

        let settings = builder.build()?;
        let raw: RawConfig = settings.try_deserialize().unwrap_or_default();

        let mut cfg = AppConfig {
            raw,
            ..AppConfig::default()
        };

        if let Ok(port) = env::var("MLLP_PORT") {
            cfg.mllp_port = port
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("MLLP_PORT".to_string()))?;
        }
        if let Ok(url) = env::var("FHIR_BASE_URL") {
            cfg.fhir_base_url = url;
        }
        if let Ok(v) = env::var("FHIR_APP") {
            cfg.fhir_app = v;
        }
        if let Ok(v) = env::var("FHIR_FAC") {
            cfg.fhir_fac = v;
        }
        if let Ok(v) = env::var("BILLING_APP") {
            cfg.billing_app = v;
        }
        if let Ok(v) = env::var("BILLING_FAC") {
            cfg.billing_fac = v;
        }
        if let Ok(v) = env::var("RUST_LOG") {
            cfg.log_level = v;
        }

        cfg.validate(&PreprocessorRegistry::default())?;
        Ok(cfg)
    }

    /// Validates identity rules are non-empty and every referenced
    /// preprocessor id is registered. Unknown ids are rejected at load time
    /// (spec §4.5, §6).
    pub fn validate(&self, registry: &PreprocessorRegistry) -> Result<(), ConfigError> {
        if self.raw.identity_system.patient.rules.is_empty() {
            return Err(ConfigError::EmptyIdentityRules);
        }

        for (msg_type, msg_cfg) in &self.raw.messages {
            for (segment, fields) in &msg_cfg.preprocess {
                for (field, ids) in fields {
                    for id in ids {
                        if !registry.contains(id) {
                            return Err(ConfigError::UnknownPreprocessor(
                                id.clone(),
                                format!("{msg_type}.{segment}.{field}"),
                            ));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub fn pv1_required(&self, message_type: &str) -> bool {
        self.raw
            .messages
            .get(message_type)
            .map(|m| m.converter.pv1.required)
            .unwrap_or(false)
    }

    pub fn preprocessors_for(&self, message_type: &str, segment: &str, field: &str) -> Vec<String> {
        self.raw
            .messages
            .get(message_type)
            .and_then(|m| m.preprocess.get(segment))
            .and_then(|f| f.get(field))
            .cloned()
            .unwrap_or_default()
    }
}

/// Read-only, process-wide registry of named preprocessor ids (spec §4.5).
/// Initialized once at startup; a test-only hook allows cache invalidation
/// (spec §5 "Shared-resource policy") — production code never calls it.
#[derive(Debug, Clone)]
pub struct PreprocessorRegistry {
    known_ids: HashSet<&'static str>,
}

impl Default for PreprocessorRegistry {
    fn default() -> Self {
        PreprocessorRegistry {
            known_ids: HashSet::from(["pid2-to-pid3", "msh-authority-for-pv1-19"]),
        }
    }
}

impl PreprocessorRegistry {
    pub fn contains(&self, id: &str) -> bool {
        self.known_ids.contains(id)
    }

    #[cfg(test)]
    pub fn invalidate_for_test(&mut self) {
        self.known_ids.clear();
    }
}
