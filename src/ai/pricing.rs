//! # Dynamic Pricing
//! Deterministic market multiplier (time of day, weekday, demand) combined with
//! an AI-suggested multiplier.
//!
//! `suggested = max(0.01, round2(base × market × ai))`, with the AI multiplier
//! clamped to `[0.5, 2.0]`. An unavailable model degrades to a neutral
//! multiplier; only an invalid context is reported as an error.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use super::adapter::{record_fallback, request_typed, DynLlmClient, LlmRequest, LlmTask};

pub const MIN_PRICE: f64 = 0.01;
pub const MAX_PRICE: f64 = 1_000_000_000.0;
pub const AI_MULTIPLIER_MIN: f64 = 0.5;
pub const AI_MULTIPLIER_MAX: f64 = 2.0;

const FALLBACK_CONFIDENCE: f64 = 0.5;
const FALLBACK_CONVERSION: f64 = 0.1;

/// Known products and their list price. Unknown products price off the caller's value.
pub const BASE_PRICES: &[(&str, f64)] = &[
    ("token_creation", 0.5),
    ("premium_features", 10.0),
    ("ai_enhancement", 2.5),
    ("viral_boost", 5.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemandLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl DemandLevel {
    pub fn factor(self) -> f64 {
        match self {
            DemandLevel::Low => 0.9,
            DemandLevel::Medium => 1.1,
            DemandLevel::High => 1.3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DemandLevel::Low => "low",
            DemandLevel::Medium => "medium",
            DemandLevel::High => "high",
        }
    }
}

/// Per-request pricing inputs. Built from the HTTP body; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingContext {
    pub product_type: String,
    pub current_price: f64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_behavior: Option<Value>,
    #[serde(default)]
    pub market_conditions: Option<Value>,
    #[serde(default)]
    pub demand_level: DemandLevel,
    /// Hour 0–23; derived from the clock when absent.
    #[serde(default)]
    pub time_of_day: Option<u32>,
    /// 0 = Sunday … 6 = Saturday; derived from the clock when absent.
    #[serde(default)]
    pub day_of_week: Option<u32>,
}

impl PricingContext {
    pub fn new(product_type: impl Into<String>, current_price: f64) -> Self {
        Self {
            product_type: product_type.into(),
            current_price,
            user_id: None,
            user_behavior: None,
            market_conditions: None,
            demand_level: DemandLevel::default(),
            time_of_day: None,
            day_of_week: None,
        }
    }

    pub fn demand(mut self, level: DemandLevel) -> Self {
        self.demand_level = level;
        self
    }

    pub fn at(mut self, hour: u32, day_of_week: u32) -> Self {
        self.time_of_day = Some(hour);
        self.day_of_week = Some(day_of_week);
        self
    }

    pub fn validate(&self) -> Result<(), PricingError> {
        if !self.current_price.is_finite()
            || self.current_price <= 0.0
            || self.current_price > MAX_PRICE
        {
            return Err(PricingError::InvalidPrice(self.current_price));
        }
        if let Some(h) = self.time_of_day {
            if h > 23 {
                return Err(PricingError::InvalidHour(h));
            }
        }
        if let Some(d) = self.day_of_week {
            if d > 6 {
                return Err(PricingError::InvalidDay(d));
            }
        }
        Ok(())
    }

    /// Hour and weekday, filling gaps from `now`.
    pub fn resolve_time(&self, now: DateTime<Utc>) -> (u32, u32) {
        (
            self.time_of_day.unwrap_or_else(|| now.hour()),
            self.day_of_week
                .unwrap_or_else(|| now.weekday().num_days_from_sunday()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PricingError {
    #[error("currentPrice must be a positive finite number, got {0}")]
    InvalidPrice(f64),
    #[error("timeOfDay must be 0-23, got {0}")]
    InvalidHour(u32),
    #[error("dayOfWeek must be 0-6, got {0}")]
    InvalidDay(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimalPricing {
    pub product_type: String,
    pub base_price: f64,
    pub suggested_price: f64,
    pub market_multiplier: f64,
    /// The model's multiplier after clamping; 1.0 when the model was unavailable.
    pub price_multiplier: f64,
    /// `market_multiplier × price_multiplier`.
    pub combined_multiplier: f64,
    pub reasoning: String,
    pub confidence: f64,
    pub expected_conversion: f64,
    pub revenue_impact: String,
    pub revenue_impact_pct: i64,
    pub ai_used: bool,
}

/// Reply shape requested from the model.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiPricingReply {
    multiplier: f64,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    expected_conversion: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Clamped AI estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AiEstimate {
    multiplier: f64,
    confidence: f64,
    expected_conversion: f64,
}

pub fn base_price_for(product_type: &str, current_price: f64) -> f64 {
    BASE_PRICES
        .iter()
        .find(|(k, _)| *k == product_type)
        .map(|(_, p)| *p)
        .unwrap_or(current_price)
}

pub fn is_business_hours(hour: u32) -> bool {
    (9..17).contains(&hour)
}

pub fn is_evening_peak(hour: u32) -> bool {
    (18..22).contains(&hour)
}

/// Monday–Friday with Sunday = 0.
pub fn is_weekday(day_of_week: u32) -> bool {
    (1..=5).contains(&day_of_week)
}

/// Product of the independent time, weekday and demand factors.
pub fn market_multiplier(hour: u32, day_of_week: u32, demand: DemandLevel) -> f64 {
    let mut m = 1.0;
    if is_business_hours(hour) {
        m *= 1.1;
    }
    if is_evening_peak(hour) {
        m *= 1.2;
    }
    if is_weekday(day_of_week) {
        m *= 1.05;
    }
    m * demand.factor()
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Final price: floored at one cent, rounded to cents.
pub fn suggested_price(base: f64, market: f64, ai: f64) -> f64 {
    let raw = base * market * ai;
    if !raw.is_finite() {
        return MIN_PRICE;
    }
    round2(raw).max(MIN_PRICE)
}

pub fn clamp_ai_multiplier(m: f64) -> f64 {
    if m.is_finite() {
        m.clamp(AI_MULTIPLIER_MIN, AI_MULTIPLIER_MAX)
    } else {
        1.0
    }
}

fn clamp_unit(x: Option<f64>, default: f64) -> f64 {
    match x {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => default,
    }
}

/// Bucketed text plus the numeric percentage it was built from.
pub fn revenue_impact(base: f64, suggested: f64) -> (String, i64) {
    let pct = ((suggested / base - 1.0) * 100.0).round();
    let pct = if pct.is_finite() { pct as i64 } else { 0 };
    let bucket = if pct >= 20 {
        "high"
    } else if pct >= 5 {
        "moderate"
    } else if pct > -5 {
        "neutral"
    } else {
        "negative"
    };
    (format!("{bucket} ({pct:+}%)"), pct)
}

pub struct DynamicPricingEngine {
    llm: DynLlmClient,
}

impl DynamicPricingEngine {
    pub fn new(llm: DynLlmClient) -> Self {
        Self { llm }
    }

    pub async fn calculate_optimal_price(
        &self,
        ctx: &PricingContext,
    ) -> Result<OptimalPricing, PricingError> {
        self.calculate_optimal_price_at(ctx, Utc::now()).await
    }

    /// Same as `calculate_optimal_price` with an explicit clock.
    pub async fn calculate_optimal_price_at(
        &self,
        ctx: &PricingContext,
        now: DateTime<Utc>,
    ) -> Result<OptimalPricing, PricingError> {
        ctx.validate()?;

        let (hour, day) = ctx.resolve_time(now);
        let base = base_price_for(&ctx.product_type, ctx.current_price);
        let market = market_multiplier(hour, day, ctx.demand_level);

        let req = LlmRequest::new(
            LlmTask::Pricing,
            PRICING_SYSTEM_PROMPT,
            pricing_prompt(ctx, base, market, hour, day),
        )
        .max_tokens(300);

        let (estimate, reasoning, ai_used) =
            match request_typed::<AiPricingReply>(self.llm.as_ref(), &req).await {
                Ok(reply) => {
                    let est = AiEstimate {
                        multiplier: clamp_ai_multiplier(reply.multiplier),
                        confidence: clamp_unit(reply.confidence, FALLBACK_CONFIDENCE),
                        expected_conversion: clamp_unit(
                            reply.expected_conversion,
                            FALLBACK_CONVERSION,
                        ),
                    };
                    let reasoning = reply
                        .reasoning
                        .filter(|r| !r.trim().is_empty())
                        .unwrap_or_else(|| "Model gave no reasoning.".to_string());
                    (est, reasoning, true)
                }
                Err(e) => {
                    record_fallback(LlmTask::Pricing, &e);
                    (
                        AiEstimate {
                            multiplier: 1.0,
                            confidence: FALLBACK_CONFIDENCE,
                            expected_conversion: FALLBACK_CONVERSION,
                        },
                        "AI pricing unavailable; market-based multiplier applied.".to_string(),
                        false,
                    )
                }
            };

        let suggested = suggested_price(base, market, estimate.multiplier);
        let (impact, impact_pct) = revenue_impact(base, suggested);

        info!(
            target: "pricing",
            product = %ctx.product_type,
            user = ctx.user_id.as_deref().unwrap_or("-"),
            base, market, ai = estimate.multiplier, suggested, ai_used,
            "price calculated"
        );

        Ok(OptimalPricing {
            product_type: ctx.product_type.clone(),
            base_price: base,
            suggested_price: suggested,
            market_multiplier: market,
            price_multiplier: estimate.multiplier,
            combined_multiplier: market * estimate.multiplier,
            reasoning,
            confidence: estimate.confidence,
            expected_conversion: estimate.expected_conversion,
            revenue_impact: impact,
            revenue_impact_pct: impact_pct,
            ai_used,
        })
    }
}

const PRICING_SYSTEM_PROMPT: &str = "You are a pricing analyst for a digital product platform. \
Respond with a single JSON object and nothing else.";

fn pricing_prompt(ctx: &PricingContext, base: f64, market: f64, hour: u32, day: u32) -> String {
    let behavior = ctx
        .user_behavior
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_else(|| "unknown".into());
    let conditions = ctx
        .market_conditions
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_else(|| "unknown".into());
    format!(
        r#"Suggest a price multiplier for this product.

Product type: {product}
Base price: {base:.2}
Current price: {current:.2}
Demand level: {demand}
Hour of day (UTC): {hour}
Day of week (0 = Sunday): {day}
Market multiplier already applied: {market:.3}
User behavior: {behavior}
Market conditions: {conditions}

Return JSON:
{{
  "multiplier": number between 0.5 and 2.0,
  "confidence": number between 0 and 1,
  "expectedConversion": number between 0 and 1,
  "reasoning": "one or two sentences"
}}"#,
        product = ctx.product_type,
        current = ctx.current_price,
        demand = ctx.demand_level.as_str(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::adapter::{LlmError, ScriptedClient};
    use serde_json::json;
    use std::sync::Arc;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn demand_factor_scales_time_factors() {
        // Tuesday 10:00: business hours and weekday.
        let time = 1.1 * 1.05;
        assert!(approx(market_multiplier(10, 2, DemandLevel::Low), time * 0.9));
        assert!(approx(market_multiplier(10, 2, DemandLevel::Medium), time * 1.1));
        assert!(approx(market_multiplier(10, 2, DemandLevel::High), time * 1.3));
    }

    #[test]
    fn time_windows() {
        // Saturday 19:00: evening peak only.
        assert!(approx(market_multiplier(19, 6, DemandLevel::Low), 1.2 * 0.9));
        // Sunday 03:00: nothing but demand.
        assert!(approx(market_multiplier(3, 0, DemandLevel::High), 1.3));
        assert!(is_business_hours(9) && !is_business_hours(17));
        assert!(is_evening_peak(18) && !is_evening_peak(22));
        assert!(!is_business_hours(17) && !is_evening_peak(17));
    }

    #[test]
    fn suggested_price_is_floored_and_rounded() {
        for base in [0.0001, 0.004, 0.333, 1.0, 12.345, 99_999.999] {
            for ai in [AI_MULTIPLIER_MIN, 1.0, AI_MULTIPLIER_MAX] {
                for market in [0.9, 1.2012, 1.8018] {
                    let p = suggested_price(base, market, ai);
                    assert!(p >= MIN_PRICE, "{p} below floor");
                    assert!(approx(p, round2(p)), "{p} not rounded to cents");
                }
            }
        }
        assert_eq!(suggested_price(f64::MAX, 2.0, 2.0), MIN_PRICE);
    }

    #[test]
    fn ai_multiplier_clamped() {
        assert_eq!(clamp_ai_multiplier(0.1), 0.5);
        assert_eq!(clamp_ai_multiplier(7.0), 2.0);
        assert_eq!(clamp_ai_multiplier(f64::NAN), 1.0);
        assert_eq!(clamp_ai_multiplier(1.3), 1.3);
    }

    #[test]
    fn unknown_product_uses_caller_price() {
        assert_eq!(base_price_for("premium_features", 3.0), 10.0);
        assert_eq!(base_price_for("mystery", 3.0), 3.0);
    }

    #[test]
    fn revenue_buckets() {
        assert_eq!(revenue_impact(10.0, 12.0), ("high (+20%)".to_string(), 20));
        assert_eq!(revenue_impact(10.0, 10.6).1, 6);
        assert!(revenue_impact(10.0, 10.0).0.starts_with("neutral"));
        assert!(revenue_impact(10.0, 5.0).0.starts_with("negative"));
    }

    #[test]
    fn rejects_invalid_context() {
        assert!(matches!(
            PricingContext::new("x", 0.0).validate(),
            Err(PricingError::InvalidPrice(_))
        ));
        assert!(PricingContext::new("x", f64::NAN).validate().is_err());
        assert_eq!(
            PricingContext::new("x", 1.0).at(24, 1).validate(),
            Err(PricingError::InvalidHour(24))
        );
        assert_eq!(
            PricingContext::new("x", 1.0).at(1, 7).validate(),
            Err(PricingError::InvalidDay(7))
        );
    }

    #[tokio::test]
    async fn scenario_premium_features_high_demand() {
        let llm = Arc::new(ScriptedClient::new(|_| {
            Ok(json!({
                "multiplier": 1.2,
                "confidence": 0.9,
                "expectedConversion": 0.2,
                "reasoning": "x"
            }))
        }));
        let engine = DynamicPricingEngine::new(llm);
        let ctx = PricingContext::new("premium_features", 10.0)
            .demand(DemandLevel::High)
            .at(11, 3);

        let out = engine.calculate_optimal_price(&ctx).await.unwrap();
        assert!((out.market_multiplier - 1.502).abs() < 1e-3);
        assert_eq!(out.suggested_price, 18.02);
        assert_eq!(out.price_multiplier, 1.2);
        assert!((out.combined_multiplier - 1.502 * 1.2).abs() < 1e-3);
        assert!(out.ai_used);
        assert_eq!(out.reasoning, "x");
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_neutral() {
        let llm = Arc::new(ScriptedClient::new(|_| Err(LlmError::Status(503))));
        let engine = DynamicPricingEngine::new(llm);
        let ctx = PricingContext::new("viral_boost", 4.0).at(3, 0);

        let out = engine.calculate_optimal_price(&ctx).await.unwrap();
        assert_eq!(out.confidence, 0.5);
        assert_eq!(out.price_multiplier, 1.0);
        assert!(!out.ai_used);
        // 5.0 base × 1.1 medium demand
        assert_eq!(out.suggested_price, 5.5);
    }

    #[tokio::test]
    async fn rejected_model_call_reports_neutral_multiplier() {
        let llm = Arc::new(ScriptedClient::new(|_| Err(LlmError::Status(503))));
        let engine = DynamicPricingEngine::new(llm);
        let ctx = PricingContext::new("premium_features", 10.0).at(11, 3);

        let out = engine.calculate_optimal_price(&ctx).await.unwrap();
        assert_eq!(out.confidence, 0.5);
        assert_eq!(out.price_multiplier, 1.0);
        assert_eq!(out.combined_multiplier, out.market_multiplier);
        assert!(out.suggested_price >= MIN_PRICE);
    }

    #[tokio::test]
    async fn out_of_range_reply_is_clamped() {
        let llm = Arc::new(ScriptedClient::new(|_| {
            Ok(json!({"multiplier": 9.0, "confidence": 3.0, "expectedConversion": -1.0}))
        }));
        let engine = DynamicPricingEngine::new(llm);
        let ctx = PricingContext::new("ai_enhancement", 1.0).at(3, 0);

        let out = engine.calculate_optimal_price(&ctx).await.unwrap();
        assert_eq!(out.price_multiplier, 2.0);
        assert_eq!(out.confidence, 1.0);
        assert_eq!(out.expected_conversion, 0.0);
        assert_eq!(out.suggested_price, round2(2.5 * 1.1 * 2.0));
    }
}
