// src/config/app.rs
//! Top-level service configuration.
//!
//! TOML shape (every section optional):
//! ```toml
//! [ai]
//! model = "gpt-4o-mini"
//!
//! [viral]
//! max_concurrency = 4
//!
//! [auth]
//! allow_dev_tokens = true
//! [[auth.grants]]
//! token = "ops-token"
//! subject = "ops"
//! capabilities = ["escrow_read"]
//! ```

use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};
use tracing::{info, warn};

use super::ai::AiConfig;
use crate::auth::Capability;

pub const DEFAULT_APP_CONFIG_PATH: &str = "config/app.toml";
pub const ENV_APP_CONFIG_PATH: &str = "APP_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ai: AiConfig,
    pub viral: ViralConfig,
    pub optimizer: OptimizerConfig,
    pub auth: AuthConfig,
    pub escrow: EscrowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViralConfig {
    /// Upper bound on in-flight generations per campaign.
    pub max_concurrency: usize,
    pub max_campaign_days: u32,
    pub pattern_capacity: usize,
}

impl Default for ViralConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_campaign_days: 30,
            pattern_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub history_capacity: usize,
    /// Recommendations strictly above this confidence are auto-applied.
    pub auto_apply_confidence: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 200,
            auto_apply_confidence: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Grants `admin-demo-token` and `development` full access.
    pub allow_dev_tokens: bool,
    pub grants: Vec<TokenGrant>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_dev_tokens: true,
            grants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub subject: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    pub rpc_url: String,
    pub min_contract_value: Decimal,
    pub max_signatories: usize,
    /// Only ever populated from SERVICE_PRIVATE_KEY.
    #[serde(skip)]
    pub service_private_key: Option<String>,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.devnet.solana.com".to_string(),
            min_contract_value: Decimal::from(200_000u32),
            max_signatories: 10,
            service_private_key: None,
        }
    }
}

impl AppConfig {
    /// Load from `APP_CONFIG_PATH` (or `config/app.toml`). A missing file yields defaults;
    /// a malformed one is an error.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var(ENV_APP_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_APP_CONFIG_PATH.into());
        let mut cfg = if Path::new(&path).exists() {
            Self::load_from_file(&path)?
        } else {
            info!(target: "config", %path, "config file not found, using defaults");
            Self::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml_str(data: &str) -> anyhow::Result<Self> {
        let mut cfg: AppConfig = toml::from_str(data)?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Environment overrides. Secrets are read here and nowhere else.
    pub fn apply_env(&mut self) {
        self.ai.resolve_env();
        if let Ok(url) = env::var("SOLANA_RPC_URL") {
            if !url.trim().is_empty() {
                self.escrow.rpc_url = url.trim().to_string();
            }
        }
        self.escrow.service_private_key = env::var("SERVICE_PRIVATE_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        self.sanitize();
    }

    fn sanitize(&mut self) {
        let d = ViralConfig::default();
        if self.viral.max_concurrency == 0 {
            self.viral.max_concurrency = d.max_concurrency;
        }
        if self.viral.max_campaign_days == 0 {
            self.viral.max_campaign_days = d.max_campaign_days;
        }
        if self.viral.pattern_capacity == 0 {
            self.viral.pattern_capacity = d.pattern_capacity;
        }

        let o = OptimizerConfig::default();
        if self.optimizer.history_capacity == 0 {
            self.optimizer.history_capacity = o.history_capacity;
        }
        if !(0.0..=1.0).contains(&self.optimizer.auto_apply_confidence) {
            warn!(
                target: "config",
                value = self.optimizer.auto_apply_confidence,
                "auto_apply_confidence out of range, using default"
            );
            self.optimizer.auto_apply_confidence = o.auto_apply_confidence;
        }

        if self.escrow.max_signatories < 2 {
            self.escrow.max_signatories = EscrowConfig::default().max_signatories;
        }
        if self.escrow.min_contract_value.is_sign_negative() {
            self.escrow.min_contract_value = EscrowConfig::default().min_contract_value;
        }
    }
}
