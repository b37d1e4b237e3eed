// src/ai/mod.rs
//! Recommendation pipelines: each builds a prompt, asks the model for strict
//! JSON, clamps the reply into typed records and falls back to fixed data when
//! the model is unavailable.

pub mod adapter;
pub mod full_analysis;
pub mod optimizer;
pub mod pricing;
pub mod viral;

// Re-export convenient types.
pub use adapter::{build_llm_client, DynLlmClient, LlmClient, LlmError, LlmRequest, LlmTask};
pub use full_analysis::{run_full_analysis, FullAnalysis, FullAnalysisRequest};
pub use optimizer::{OptimizationRecommendation, PlatformMetrics, SelfOptimizer};
pub use pricing::{DynamicPricingEngine, OptimalPricing, PricingContext};
pub use viral::{ViralContent, ViralContentGenerator};
