//! Self-optimization: metric deltas against a fixed baseline, AI recommendations
//! ranked by `priority_weight × confidence`, follow-up plans and A/B designs,
//! and a continuous mode that auto-applies confident non-critical items.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::adapter::{
    record_fallback, request_typed, DynLlmClient, LlmError, LlmRequest, LlmTask,
};
use crate::history::BoundedHistory;

pub const RECOMMENDATION_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformMetrics {
    pub conversion_rate: f64,
    pub user_engagement: f64,
    /// Seconds.
    pub page_load_time: f64,
    pub bounce_rate: f64,
    /// 1–5 scale.
    pub user_satisfaction: f64,
    pub revenue_per_user: f64,
}

pub const PERFORMANCE_BASELINE: PlatformMetrics = PlatformMetrics {
    conversion_rate: 0.025,
    user_engagement: 0.35,
    page_load_time: 2.5,
    bounce_rate: 0.45,
    user_satisfaction: 4.0,
    revenue_per_user: 12.0,
};

impl PlatformMetrics {
    fn fields(&self) -> [(&'static str, f64); 6] {
        [
            ("conversionRate", self.conversion_rate),
            ("userEngagement", self.user_engagement),
            ("pageLoadTime", self.page_load_time),
            ("bounceRate", self.bounce_rate),
            ("userSatisfaction", self.user_satisfaction),
            ("revenuePerUser", self.revenue_per_user),
        ]
    }

    pub fn validate(&self) -> Result<(), OptimizerError> {
        for (name, v) in self.fields() {
            if !v.is_finite() || v < 0.0 {
                return Err(OptimizerError::InvalidMetric(name));
            }
        }
        Ok(())
    }
}

/// Percentage change of each metric against the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDeltas {
    pub conversion_rate: f64,
    pub user_engagement: f64,
    pub page_load_time: f64,
    pub bounce_rate: f64,
    pub user_satisfaction: f64,
    pub revenue_per_user: f64,
}

fn pct_delta(current: f64, baseline: f64) -> f64 {
    if baseline == 0.0 {
        0.0
    } else {
        (current - baseline) / baseline * 100.0
    }
}

pub fn compute_deltas(current: &PlatformMetrics, baseline: &PlatformMetrics) -> MetricDeltas {
    MetricDeltas {
        conversion_rate: pct_delta(current.conversion_rate, baseline.conversion_rate),
        user_engagement: pct_delta(current.user_engagement, baseline.user_engagement),
        page_load_time: pct_delta(current.page_load_time, baseline.page_load_time),
        bounce_rate: pct_delta(current.bounce_rate, baseline.bounce_rate),
        user_satisfaction: pct_delta(current.user_satisfaction, baseline.user_satisfaction),
        revenue_per_user: pct_delta(current.revenue_per_user, baseline.revenue_per_user),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "UX")]
    Ux,
    Performance,
    Content,
    Conversion,
    Engagement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

pub fn priority_weight(p: Priority) -> f64 {
    match p {
        Priority::Critical => 4.0,
        Priority::High => 3.0,
        Priority::Medium => 2.0,
        Priority::Low => 1.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRecommendation {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub category: Category,
    pub priority: Priority,
    pub title: String,
    pub description: String,
    pub implementation: String,
    pub expected_impact: String,
    pub confidence: f64,
    pub time_to_implement: String,
    pub potential_roi: String,
    pub potential_roi_pct: u32,
}

impl OptimizationRecommendation {
    pub fn weight(&self) -> f64 {
        priority_weight(self.priority) * self.confidence
    }
}

/// Stable sort by `priority_weight × confidence`, highest first.
pub fn prioritize_recommendations(
    mut recs: Vec<OptimizationRecommendation>,
) -> Vec<OptimizationRecommendation> {
    recs.sort_by(|a, b| b.weight().total_cmp(&a.weight()));
    recs
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendationReply {
    category: Category,
    priority: Priority,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    implementation: String,
    #[serde(default)]
    expected_impact: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    time_to_implement: String,
    #[serde(default)]
    potential_roi: String,
    potential_roi_pct: f64,
}

impl From<RecommendationReply> for OptimizationRecommendation {
    fn from(r: RecommendationReply) -> Self {
        let confidence = if r.confidence.is_finite() {
            r.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let roi_pct = if r.potential_roi_pct.is_finite() {
            r.potential_roi_pct.round().clamp(0.0, 1000.0) as u32
        } else {
            0
        };
        let potential_roi = if r.potential_roi.trim().is_empty() {
            format!("{roi_pct}%")
        } else {
            r.potential_roi
        };
        Self {
            id: Uuid::new_v4(),
            category: r.category,
            priority: r.priority,
            title: r.title,
            description: r.description,
            implementation: r.implementation,
            expected_impact: r.expected_impact,
            confidence,
            time_to_implement: r.time_to_implement,
            potential_roi,
            potential_roi_pct: roi_pct,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecommendationsReply {
    recommendations: Vec<RecommendationReply>,
}

#[derive(Debug, Deserialize)]
struct PlanReply {
    #[serde(default)]
    steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizerError {
    #[error("metric '{0}' must be a non-negative finite number")]
    InvalidMetric(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationAnalysis {
    pub metrics: PlatformMetrics,
    pub deltas: MetricDeltas,
    pub recommendations: Vec<OptimizationRecommendation>,
    pub ai_used: bool,
}

/// History record of one analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRun {
    pub at: DateTime<Utc>,
    pub metrics: PlatformMetrics,
    pub recommendation_count: usize,
    pub top_recommendation: Option<String>,
    pub ai_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuousReport {
    pub metrics: PlatformMetrics,
    pub applied: Vec<OptimizationRecommendation>,
    pub deferred: Vec<OptimizationRecommendation>,
    pub performance_gain: f64,
}

/// Where continuous mode reads its current metrics from.
pub trait MetricsSource: Send + Sync {
    fn current_metrics(&self) -> PlatformMetrics;
}

/// A fixed snapshot.
impl MetricsSource for PlatformMetrics {
    fn current_metrics(&self) -> PlatformMetrics {
        *self
    }
}

/// Random metrics within plausible ranges; there is no live telemetry feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedMetrics;

impl MetricsSource for SimulatedMetrics {
    fn current_metrics(&self) -> PlatformMetrics {
        let mut rng = rand::rng();
        PlatformMetrics {
            conversion_rate: rng.random_range(0.01..0.05),
            user_engagement: rng.random_range(0.2..0.6),
            page_load_time: rng.random_range(1.0..4.0),
            bounce_rate: rng.random_range(0.3..0.7),
            user_satisfaction: rng.random_range(3.0..5.0),
            revenue_per_user: rng.random_range(8.0..20.0),
        }
    }
}

pub struct SelfOptimizer {
    llm: DynLlmClient,
    history: Arc<BoundedHistory<OptimizationRun>>,
    auto_apply_confidence: f64,
}

impl SelfOptimizer {
    pub fn new(
        llm: DynLlmClient,
        history: Arc<BoundedHistory<OptimizationRun>>,
        auto_apply_confidence: f64,
    ) -> Self {
        Self {
            llm,
            history,
            auto_apply_confidence,
        }
    }

    pub async fn analyze_and_optimize(
        &self,
        metrics: &PlatformMetrics,
    ) -> Result<OptimizationAnalysis, OptimizerError> {
        metrics.validate()?;
        let deltas = compute_deltas(metrics, &PERFORMANCE_BASELINE);

        let req = LlmRequest::new(
            LlmTask::Optimization,
            OPTIMIZER_SYSTEM_PROMPT,
            analysis_prompt(metrics, &deltas),
        )
        .max_tokens(1500);

        let (recs, ai_used) =
            match request_typed::<RecommendationsReply>(self.llm.as_ref(), &req).await {
                Ok(reply) if !reply.recommendations.is_empty() => (
                    reply
                        .recommendations
                        .into_iter()
                        .take(RECOMMENDATION_COUNT)
                        .map(OptimizationRecommendation::from)
                        .collect::<Vec<_>>(),
                    true,
                ),
                Ok(_) => {
                    record_fallback(LlmTask::Optimization, &LlmError::EmptyReply);
                    (fallback_recommendations(), false)
                }
                Err(e) => {
                    record_fallback(LlmTask::Optimization, &e);
                    (fallback_recommendations(), false)
                }
            };
        let recommendations = prioritize_recommendations(recs);

        self.history.push(OptimizationRun {
            at: Utc::now(),
            metrics: *metrics,
            recommendation_count: recommendations.len(),
            top_recommendation: recommendations.first().map(|r| r.title.clone()),
            ai_used,
        });
        info!(
            target: "optimizer",
            count = recommendations.len(),
            ai_used,
            conversion_delta = deltas.conversion_rate,
            "optimization analysis complete"
        );

        Ok(OptimizationAnalysis {
            metrics: *metrics,
            deltas,
            recommendations,
            ai_used,
        })
    }

    pub async fn generate_implementation_plan(
        &self,
        rec: &OptimizationRecommendation,
    ) -> Vec<String> {
        let req = LlmRequest::new(
            LlmTask::ImplementationPlan,
            OPTIMIZER_SYSTEM_PROMPT,
            format!(
                r#"Create a step-by-step implementation plan for this recommendation.

Title: {title}
Category: {category:?}
Description: {description}
Implementation notes: {implementation}

Return JSON: {{ "steps": ["step 1", "step 2", "..."] }}"#,
                title = rec.title,
                category = rec.category,
                description = rec.description,
                implementation = rec.implementation,
            ),
        )
        .max_tokens(600);

        match request_typed::<PlanReply>(self.llm.as_ref(), &req).await {
            Ok(p) if !p.steps.is_empty() => p.steps,
            Ok(_) => {
                record_fallback(LlmTask::ImplementationPlan, &LlmError::EmptyReply);
                fallback_plan(rec)
            }
            Err(e) => {
                record_fallback(LlmTask::ImplementationPlan, &e);
                fallback_plan(rec)
            }
        }
    }

    /// Free-form A/B test design as returned by the model.
    pub async fn design_ab_test(&self, rec: &OptimizationRecommendation) -> Value {
        let req = LlmRequest::new(
            LlmTask::AbTest,
            OPTIMIZER_SYSTEM_PROMPT,
            format!(
                r#"Design an A/B test validating this change.

Title: {title}
Expected impact: {impact}

Return JSON with keys: hypothesis, variants, primaryMetric, sampleSize, durationDays."#,
                title = rec.title,
                impact = rec.expected_impact,
            ),
        )
        .max_tokens(600);

        match request_typed::<Value>(self.llm.as_ref(), &req).await {
            Ok(v) if v.is_object() => v,
            Ok(_) => {
                record_fallback(LlmTask::AbTest, &LlmError::Schema("expected object".into()));
                fallback_ab_test(rec)
            }
            Err(e) => {
                record_fallback(LlmTask::AbTest, &e);
                fallback_ab_test(rec)
            }
        }
    }

    /// Analyze the source's current metrics and auto-apply every recommendation
    /// above the confidence threshold that is not Critical.
    pub async fn continuous_optimization(
        &self,
        source: &dyn MetricsSource,
    ) -> Result<ContinuousReport, OptimizerError> {
        let metrics = source.current_metrics();
        let analysis = self.analyze_and_optimize(&metrics).await?;

        let (applied, deferred): (Vec<_>, Vec<_>) =
            analysis.recommendations.into_iter().partition(|r| {
                r.confidence > self.auto_apply_confidence && r.priority != Priority::Critical
            });
        let performance_gain: f64 = applied.iter().map(OptimizationRecommendation::weight).sum();

        info!(
            target: "optimizer",
            applied = applied.len(),
            deferred = deferred.len(),
            performance_gain,
            "continuous optimization cycle"
        );

        Ok(ContinuousReport {
            metrics,
            applied,
            deferred,
            performance_gain,
        })
    }

    pub fn history(&self, n: usize) -> Vec<OptimizationRun> {
        self.history.snapshot_last_n(n)
    }
}

pub fn fallback_recommendations() -> Vec<OptimizationRecommendation> {
    vec![
        OptimizationRecommendation {
            id: Uuid::new_v4(),
            category: Category::Performance,
            priority: Priority::High,
            title: "Optimize asset loading".into(),
            description: "Compress images and defer non-critical scripts to cut load time.".into(),
            implementation: "Enable image compression, lazy-load below-the-fold panels, \
                             split bundles."
                .into(),
            expected_impact: "20-30% faster page loads".into(),
            confidence: 0.85,
            time_to_implement: "1-2 weeks".into(),
            potential_roi: "15%".into(),
            potential_roi_pct: 15,
        },
        OptimizationRecommendation {
            id: Uuid::new_v4(),
            category: Category::Conversion,
            priority: Priority::Medium,
            title: "Streamline checkout flow".into(),
            description: "Remove optional steps and surface trust signals at payment.".into(),
            implementation: "Collapse checkout to a single page and add progress indicators."
                .into(),
            expected_impact: "10-15% higher conversion".into(),
            confidence: 0.75,
            time_to_implement: "2-3 weeks".into(),
            potential_roi: "20%".into(),
            potential_roi_pct: 20,
        },
    ]
}

fn fallback_plan(rec: &OptimizationRecommendation) -> Vec<String> {
    vec![
        format!("Define success metrics for '{}'", rec.title),
        "Capture a baseline for the affected flow".into(),
        "Implement the change behind a feature flag".into(),
        "Roll out gradually and monitor the metrics".into(),
        "Review results and make the change permanent or roll back".into(),
    ]
}

fn fallback_ab_test(rec: &OptimizationRecommendation) -> Value {
    json!({
        "hypothesis": format!("'{}' improves the primary metric", rec.title),
        "variants": ["control", "treatment"],
        "primaryMetric": "conversion_rate",
        "sampleSize": 1000,
        "durationDays": 14,
        "fallback": true
    })
}

const OPTIMIZER_SYSTEM_PROMPT: &str = "You are a product growth and web performance expert. \
Respond with a single JSON object and nothing else.";

fn analysis_prompt(m: &PlatformMetrics, d: &MetricDeltas) -> String {
    format!(
        r#"Analyze these platform metrics and recommend exactly {n} improvements.

Current metrics:
- conversion rate: {cr:.4} ({dcr:+.1}% vs baseline)
- user engagement: {ue:.3} ({due:+.1}%)
- page load time: {lt:.2}s ({dlt:+.1}%)
- bounce rate: {br:.3} ({dbr:+.1}%)
- user satisfaction: {us:.2}/5 ({dus:+.1}%)
- revenue per user: {rpu:.2} ({drpu:+.1}%)

Return JSON:
{{
  "recommendations": [
    {{
      "category": "UX" | "Performance" | "Content" | "Conversion" | "Engagement",
      "priority": "Critical" | "High" | "Medium" | "Low",
      "title": "...",
      "description": "...",
      "implementation": "...",
      "expectedImpact": "...",
      "confidence": number between 0 and 1,
      "timeToImplement": "...",
      "potentialRoi": "short text",
      "potentialRoiPct": integer percentage
    }}
  ]
}}"#,
        n = RECOMMENDATION_COUNT,
        cr = m.conversion_rate,
        dcr = d.conversion_rate,
        ue = m.user_engagement,
        due = d.user_engagement,
        lt = m.page_load_time,
        dlt = d.page_load_time,
        br = m.bounce_rate,
        dbr = d.bounce_rate,
        us = m.user_satisfaction,
        dus = d.user_satisfaction,
        rpu = m.revenue_per_user,
        drpu = d.revenue_per_user,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::adapter::ScriptedClient;

    fn rec(title: &str, priority: Priority, confidence: f64) -> OptimizationRecommendation {
        OptimizationRecommendation {
            id: Uuid::new_v4(),
            category: Category::Ux,
            priority,
            title: title.into(),
            description: String::new(),
            implementation: String::new(),
            expected_impact: String::new(),
            confidence,
            time_to_implement: String::new(),
            potential_roi: "5%".into(),
            potential_roi_pct: 5,
        }
    }

    fn optimizer(llm: Arc<ScriptedClient>) -> SelfOptimizer {
        SelfOptimizer::new(llm, Arc::new(BoundedHistory::with_capacity(10)), 0.8)
    }

    fn reply_rec(priority: &str, confidence: f64, roi: f64) -> Value {
        json!({
            "category": "Performance",
            "priority": priority,
            "title": format!("{priority}-{confidence}"),
            "confidence": confidence,
            "potentialRoiPct": roi
        })
    }

    #[test]
    fn deltas_against_baseline() {
        let mut m = PERFORMANCE_BASELINE;
        m.conversion_rate = 0.05;
        m.page_load_time = 1.25;
        let d = compute_deltas(&m, &PERFORMANCE_BASELINE);
        assert!((d.conversion_rate - 100.0).abs() < 1e-9);
        assert!((d.page_load_time + 50.0).abs() < 1e-9);
        assert_eq!(d.bounce_rate, 0.0);
    }

    #[test]
    fn sort_is_descending_by_weight_and_stable() {
        let recs = vec![
            rec("low-ish", Priority::Low, 0.9),       // 0.9
            rec("tie-a", Priority::Medium, 0.6),      // 1.2
            rec("top", Priority::Critical, 0.9),      // 3.6
            rec("tie-b", Priority::High, 0.4),        // 1.2
            rec("tie-c", Priority::Medium, 0.6),      // 1.2
        ];
        let titles: Vec<_> = prioritize_recommendations(recs)
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["top", "tie-a", "tie-b", "tie-c", "low-ish"]);
    }

    #[test]
    fn invalid_metrics_rejected() {
        let mut m = PERFORMANCE_BASELINE;
        m.bounce_rate = -0.1;
        assert_eq!(m.validate(), Err(OptimizerError::InvalidMetric("bounceRate")));
        m.bounce_rate = f64::NAN;
        assert!(m.validate().is_err());
    }

    #[tokio::test]
    async fn takes_five_clamps_and_ranks() {
        let llm = Arc::new(ScriptedClient::new(|_| {
            Ok(json!({ "recommendations": [
                reply_rec("Low", 0.5, 3.0),
                reply_rec("High", 1.7, 12.4),
                reply_rec("Medium", 0.5, 8.0),
                reply_rec("Critical", 0.5, 30.0),
                reply_rec("Low", 0.2, 1.0),
                reply_rec("Critical", 1.0, 99.0)
            ]}))
        }));
        let opt = optimizer(llm);
        let a = opt.analyze_and_optimize(&PERFORMANCE_BASELINE).await.unwrap();

        assert!(a.ai_used);
        assert_eq!(a.recommendations.len(), RECOMMENDATION_COUNT);
        let top = &a.recommendations[0];
        assert_eq!(top.priority, Priority::High);
        assert_eq!(top.confidence, 1.0);
        assert_eq!(top.potential_roi_pct, 12);
        assert_eq!(top.potential_roi, "12%");
        assert!(a
            .recommendations
            .windows(2)
            .all(|w| w[0].weight() >= w[1].weight()));
        assert_eq!(opt.history(10).len(), 1);
    }

    #[tokio::test]
    async fn llm_failure_returns_fixed_pair() {
        let llm = Arc::new(ScriptedClient::new(|_| Err(LlmError::Transport("x".into()))));
        let opt = optimizer(llm);
        let a = opt.analyze_and_optimize(&PERFORMANCE_BASELINE).await.unwrap();
        assert!(!a.ai_used);
        let cats: Vec<_> = a.recommendations.iter().map(|r| r.category).collect();
        assert_eq!(cats, vec![Category::Performance, Category::Conversion]);
    }

    #[tokio::test]
    async fn continuous_mode_applies_confident_non_critical() {
        let llm = Arc::new(ScriptedClient::new(|_| {
            Ok(json!({ "recommendations": [
                reply_rec("Critical", 0.95, 10.0),
                reply_rec("High", 0.9, 10.0),
                reply_rec("Low", 0.81, 10.0),
                reply_rec("Medium", 0.8, 10.0)
            ]}))
        }));
        let opt = optimizer(llm);
        let report = opt.continuous_optimization(&PERFORMANCE_BASELINE).await.unwrap();

        let applied: Vec<_> = report.applied.iter().map(|r| r.priority).collect();
        assert_eq!(applied, vec![Priority::High, Priority::Low]);
        assert_eq!(report.deferred.len(), 2);
        assert!((report.performance_gain - (3.0 * 0.9 + 1.0 * 0.81)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn plan_and_ab_test_fall_back() {
        let llm = Arc::new(ScriptedClient::new(|req| match req.task {
            LlmTask::ImplementationPlan => Ok(json!({ "steps": [] })),
            _ => Err(LlmError::Disabled),
        }));
        let opt = optimizer(llm);
        let r = rec("Speed up", Priority::High, 0.9);
        let plan = opt.generate_implementation_plan(&r).await;
        assert_eq!(plan.len(), 5);
        assert!(plan[0].contains("Speed up"));
        let design = opt.design_ab_test(&r).await;
        assert_eq!(design["fallback"], json!(true));
    }

    #[test]
    fn simulated_metrics_stay_in_range() {
        for _ in 0..50 {
            let m = SimulatedMetrics.current_metrics();
            assert!(m.validate().is_ok());
            assert!((0.01..0.05).contains(&m.conversion_rate));
            assert!((3.0..5.0).contains(&m.user_satisfaction));
        }
    }
}
