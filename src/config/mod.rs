// src/config/mod.rs
//! Service configuration: `config/app.toml` plus environment overrides.

pub mod ai;
pub mod app;

pub use ai::AiConfig;
pub use app::{AppConfig, AuthConfig, EscrowConfig, OptimizerConfig, ViralConfig};
