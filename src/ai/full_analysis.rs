//! Full analysis: pricing, viral content and optimization run concurrently and
//! are combined into one ROI figure from their typed numeric fields.

use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::optimizer::{OptimizationAnalysis, OptimizerError, PlatformMetrics, SelfOptimizer};
use super::pricing::{DynamicPricingEngine, OptimalPricing, PricingContext, PricingError};
use super::viral::{ContentType, Platform, ViralContent, ViralContentGenerator, ViralError};

pub const VIRAL_SCORE_THRESHOLD: u8 = 75;
const VIRAL_BONUS_HIGH: i64 = 100;
const VIRAL_BONUS_LOW: i64 = 50;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViralBrief {
    pub topic: String,
    pub platform: Platform,
    #[serde(default = "default_content_type")]
    pub content_type: ContentType,
}

fn default_content_type() -> ContentType {
    ContentType::Post
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullAnalysisRequest {
    pub pricing: PricingContext,
    pub viral: ViralBrief,
    pub metrics: PlatformMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullAnalysis {
    pub pricing: OptimalPricing,
    pub viral: ViralContent,
    pub optimization: OptimizationAnalysis,
    pub combined_roi: i64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("pricing: {0}")]
    Pricing(#[from] PricingError),
    #[error("viral: {0}")]
    Viral(#[from] ViralError),
    #[error("optimization: {0}")]
    Optimizer(#[from] OptimizerError),
}

/// `revenueImpactPct + (viralScore > 75 ? 100 : 50) + Σ potentialRoiPct`.
pub fn combined_roi(
    pricing: &OptimalPricing,
    viral: &ViralContent,
    optimization: &OptimizationAnalysis,
) -> i64 {
    let viral_bonus = if viral.viral_score > VIRAL_SCORE_THRESHOLD {
        VIRAL_BONUS_HIGH
    } else {
        VIRAL_BONUS_LOW
    };
    let roi_sum: i64 = optimization
        .recommendations
        .iter()
        .map(|r| i64::from(r.potential_roi_pct))
        .sum();
    pricing.revenue_impact_pct + viral_bonus + roi_sum
}

/// Any branch error fails the whole analysis; no partial result is returned.
pub async fn run_full_analysis(
    pricing: &DynamicPricingEngine,
    viral: &ViralContentGenerator,
    optimizer: &SelfOptimizer,
    req: &FullAnalysisRequest,
) -> Result<FullAnalysis, AnalysisError> {
    let started = Instant::now();

    let (p, v, o) = tokio::try_join!(
        async { pricing.calculate_optimal_price(&req.pricing).await.map_err(AnalysisError::from) },
        async {
            let brief = &req.viral;
            viral
                .generate_viral_content(&brief.topic, brief.platform, brief.content_type)
                .await
                .map_err(AnalysisError::from)
        },
        async { optimizer.analyze_and_optimize(&req.metrics).await.map_err(AnalysisError::from) },
    )?;

    let roi = combined_roi(&p, &v, &o);
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    histogram!("full_analysis_duration_ms").record(elapsed_ms);
    info!(target: "ai", combined_roi = roi, elapsed_ms, "full analysis complete");

    Ok(FullAnalysis {
        pricing: p,
        viral: v,
        optimization: o,
        combined_roi: roi,
        generated_at: Utc::now(),
    })
}
