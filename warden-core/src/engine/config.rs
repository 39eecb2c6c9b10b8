//! Filter configuration.
//!
//! Loaded from YAML at start-up. Everything here is read once; nothing in
//! the per-exchange path consults it again.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Overrides `tee_type` from the environment.
pub const TEE_TYPE_ENV: &str = "WARDEN_TEE_TYPE";

/// Overrides `opa_path` from the environment.
pub const OPA_PATH_ENV: &str = "WARDEN_OPA_PATH";

fn default_package() -> String {
    "cleanroom.policy".to_string()
}

fn default_tee_type() -> String {
    "none".to_string()
}

/// Top-level filter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub policy: PolicySource,

    /// Reported to policies as `teeType`
    #[serde(default = "default_tee_type")]
    pub tee_type: String,

    /// WASM memory ceiling in bytes (clamped to 1MB..100MB)
    #[serde(default)]
    pub wasm_max_memory: Option<usize>,

    /// `opa` binary used to compile Rego bundles
    #[serde(default)]
    pub opa_path: Option<PathBuf>,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Where the policy comes from and which package holds the phase rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySource {
    /// A `.wasm` module, an OPA `.tar.gz` bundle, or a directory of Rego
    pub bundle: PathBuf,

    #[serde(default = "default_package")]
    pub package: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub format: TelemetryFormat,

    /// Output directory; telemetry is only written when set
    #[serde(default)]
    pub destination: Option<PathBuf>,
}

impl TelemetryConfig {
    /// The directory to write exchange spans to, if output is on.
    pub fn output_dir(&self) -> Option<&Path> {
        if self.enabled {
            self.destination.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    #[default]
    Json,
    Text,
}

impl FilterConfig {
    /// A configuration with defaults for everything but the bundle.
    pub fn for_bundle(bundle: impl Into<PathBuf>) -> Self {
        Self {
            policy: PolicySource {
                bundle: bundle.into(),
                package: default_package(),
            },
            tee_type: default_tee_type(),
            wasm_max_memory: None,
            opa_path: None,
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Load from a YAML file. Relative bundle and telemetry paths resolve
    /// against the file's directory. Environment overrides are applied.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading filter configuration from: {:?}", path);

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let mut config = Self::from_yaml_str(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Parse YAML and apply environment overrides.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut config: FilterConfig =
            serde_yaml_ng::from_str(content).context("Failed to parse configuration YAML")?;
        config.apply_env_overrides();
        debug!(
            "Configured package '{}' from {:?} (tee: {})",
            config.policy.package, config.policy.bundle, config.tee_type
        );
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(tee_type) = std::env::var(TEE_TYPE_ENV).ok().filter(|v| !v.is_empty()) {
            debug!("{} overrides tee_type with '{}'", TEE_TYPE_ENV, tee_type);
            self.tee_type = tee_type;
        }
        if let Some(opa_path) = std::env::var_os(OPA_PATH_ENV).filter(|v| !v.is_empty()) {
            debug!("{} overrides opa_path", OPA_PATH_ENV);
            self.opa_path = Some(PathBuf::from(opa_path));
        }
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.policy.bundle.is_relative() {
            self.policy.bundle = base.join(&self.policy.bundle);
        }
        if let Some(destination) = self.telemetry.destination.as_mut() {
            if destination.is_relative() {
                *destination = base.join(&*destination);
            }
        }
    }
}
