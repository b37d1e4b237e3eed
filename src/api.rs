use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::ai::adapter::{build_llm_client, DynLlmClient};
use crate::ai::full_analysis::{run_full_analysis, FullAnalysisRequest, ViralBrief};
use crate::ai::optimizer::{
    MetricsSource, OptimizationRecommendation, PlatformMetrics, SelfOptimizer, SimulatedMetrics,
};
use crate::ai::pricing::{
    base_price_for, market_multiplier, DemandLevel, DynamicPricingEngine, PricingContext,
    PricingError, MIN_PRICE,
};
use crate::ai::viral::{CampaignRequest, Platform, ViralContentGenerator};
use crate::auth::{require, Authorizer, Capability, StaticTokenAuthorizer};
use crate::config::AppConfig;
use crate::enterprise::{
    CreateEscrowRequest, EscrowWalletService, InMemoryEscrowStore, ReleaseEscrowRequest,
    WalletActionRequest,
};
use crate::error::ApiError;
use crate::history::BoundedHistory;

const DEFAULT_PATTERN_LIMIT: usize = 10;
const DEFAULT_HISTORY_LIMIT: usize = 20;

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub llm: DynLlmClient,
    pub pricing: Arc<DynamicPricingEngine>,
    pub viral: Arc<ViralContentGenerator>,
    pub optimizer: Arc<SelfOptimizer>,
    pub escrow: Arc<EscrowWalletService>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl AppState {
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let llm = build_llm_client(&cfg.ai)?;
        Ok(Self::with_llm(cfg, llm))
    }

    /// Wire every component around the given LLM client. Histories are owned here
    /// and handed to the engines.
    pub fn with_llm(cfg: &AppConfig, llm: DynLlmClient) -> Self {
        let patterns = Arc::new(BoundedHistory::with_capacity(cfg.viral.pattern_capacity));
        let runs = Arc::new(BoundedHistory::with_capacity(cfg.optimizer.history_capacity));
        let authorizer = StaticTokenAuthorizer::from_config(&cfg.auth);
        info!(target: "auth", grants = authorizer.len(), "authorizer ready");

        Self {
            pricing: Arc::new(DynamicPricingEngine::new(llm.clone())),
            viral: Arc::new(ViralContentGenerator::new(
                llm.clone(),
                patterns,
                cfg.viral.max_concurrency,
                cfg.viral.max_campaign_days,
            )),
            optimizer: Arc::new(SelfOptimizer::new(
                llm.clone(),
                runs,
                cfg.optimizer.auto_apply_confidence,
            )),
            escrow: Arc::new(EscrowWalletService::new(
                Arc::new(InMemoryEscrowStore::default()),
                &cfg.escrow,
            )),
            authorizer: Arc::new(authorizer),
            llm,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let ai = Router::new()
        .route("/dynamic-pricing/calculate", post(calculate_price))
        .route("/dynamic-pricing/market-multiplier", post(market_multiplier_only))
        .route("/viral/generate", post(viral_generate))
        .route("/viral/campaign", post(viral_campaign))
        .route("/viral/patterns/{platform}", get(viral_patterns))
        .route("/optimization/analyze", post(optimization_analyze))
        .route("/optimization/implementation-plan", post(implementation_plan))
        .route("/optimization/ab-test", post(ab_test))
        .route("/optimization/continuous", post(continuous))
        .route("/optimization/history", get(optimization_history))
        .route("/next-gen/full-analysis", post(full_analysis));

    let wallet = Router::new()
        .route("/create-escrow", post(create_escrow))
        .route("/release-escrow", post(release_escrow))
        .route("/lock-escrow", post(lock_escrow))
        .route("/dispute-escrow", post(dispute_escrow))
        .route("/{wallet_id}", get(get_wallet))
        .route("/{wallet_id}/report", get(wallet_report));

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/health/details", get(health_details))
        .nest("/api/ai", ai)
        .nest("/api/enterprise/wallet", wallet)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// Extractor rejections are rendered through `ApiError` so every reply keeps the envelope.

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

fn path<T>(param: Result<Path<T>, PathRejection>) -> Result<T, ApiError> {
    param
        .map(|Path(v)| v)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    params
        .map(|Query(v)| v)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

async fn health_details(State(state): State<AppState>) -> Json<Value> {
    let key = state.escrow.service_key();
    Json(json!({
        "success": true,
        "llmProvider": state.llm.provider_name(),
        "solanaRpcUrl": state.escrow.rpc_url(),
        "serviceKeyId": key.key_id(),
        "ephemeralServiceKey": key.is_ephemeral(),
        "escrowWallets": state.escrow.wallet_count().await,
    }))
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Best-effort price echoed back with a 400 so clients can keep selling.
fn pricing_fallback(raw: &Value) -> Value {
    let product = raw.get("productType").and_then(Value::as_str).unwrap_or_default();
    let current = raw
        .get("currentPrice")
        .and_then(Value::as_f64)
        .filter(|p| p.is_finite() && *p > 0.0)
        .unwrap_or(0.0);
    let price = base_price_for(product, current).max(MIN_PRICE);
    json!({
        "productType": product,
        "suggestedPrice": price,
        "priceMultiplier": 1.0,
        "confidence": 0.5,
    })
}

// Any bad input is a 400 carrying a fallback price.
async fn calculate_price(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let raw = payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::with_fallback(e.body_text(), pricing_fallback(&Value::Null)))?;
    let ctx: PricingContext = serde_json::from_value(raw.clone())
        .map_err(|e| ApiError::with_fallback(e.to_string(), pricing_fallback(&raw)))?;
    let pricing = state
        .pricing
        .calculate_optimal_price(&ctx)
        .await
        .map_err(|e: PricingError| {
            ApiError::with_fallback(e.to_string(), pricing_fallback(&raw))
        })?;
    Ok(Json(json!({ "success": true, "pricing": pricing })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketReq {
    #[serde(default)]
    demand_level: DemandLevel,
    time_of_day: Option<u32>,
    day_of_week: Option<u32>,
}

async fn market_multiplier_only(
    State(_): State<AppState>,
    payload: Result<Json<MarketReq>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    // Reuse context validation for the hour and day bounds.
    let mut ctx = PricingContext::new("market", 1.0).demand(req.demand_level);
    ctx.time_of_day = req.time_of_day;
    ctx.day_of_week = req.day_of_week;
    ctx.validate().map_err(|e| ApiError::bad_request(e.to_string()))?;

    let (hour, day) = ctx.resolve_time(chrono::Utc::now());
    Ok(Json(json!({
        "success": true,
        "marketMultiplier": market_multiplier(hour, day, req.demand_level),
        "timeOfDay": hour,
        "dayOfWeek": day,
        "demandLevel": req.demand_level,
    })))
}

// ---------------------------------------------------------------------------
// Viral
// ---------------------------------------------------------------------------

async fn viral_generate(
    State(state): State<AppState>,
    payload: Result<Json<ViralBrief>, JsonRejection>,
) -> ApiResult {
    let brief = body(payload)?;
    let content = state
        .viral
        .generate_viral_content(&brief.topic, brief.platform, brief.content_type)
        .await?;
    Ok(Json(json!({ "success": true, "content": content })))
}

async fn viral_campaign(
    State(state): State<AppState>,
    payload: Result<Json<CampaignRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let campaign = state.viral.create_viral_campaign(&req).await?;
    Ok(Json(json!({
        "success": true,
        "totalItems": campaign.len(),
        "campaign": campaign,
    })))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn viral_patterns(
    State(state): State<AppState>,
    platform: Result<Path<String>, PathRejection>,
    q: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let platform: Platform = path(platform)?.parse()?;
    let q = query(q)?;
    let hashtags = state
        .viral
        .top_hashtags(platform, q.limit.unwrap_or(DEFAULT_PATTERN_LIMIT));
    Ok(Json(json!({ "success": true, "platform": platform, "hashtags": hashtags })))
}

// ---------------------------------------------------------------------------
// Optimization
// ---------------------------------------------------------------------------

async fn optimization_analyze(
    State(state): State<AppState>,
    payload: Result<Json<PlatformMetrics>, JsonRejection>,
) -> ApiResult {
    let metrics = body(payload)?;
    let analysis = state.optimizer.analyze_and_optimize(&metrics).await?;
    Ok(Json(json!({
        "success": true,
        "recommendations": analysis.recommendations,
        "deltas": analysis.deltas,
        "aiUsed": analysis.ai_used,
    })))
}

#[derive(Debug, Deserialize)]
struct RecommendationBody {
    recommendation: OptimizationRecommendation,
}

async fn implementation_plan(
    State(state): State<AppState>,
    payload: Result<Json<RecommendationBody>, JsonRejection>,
) -> ApiResult {
    let rec = body(payload)?.recommendation;
    let plan = state.optimizer.generate_implementation_plan(&rec).await;
    Ok(Json(json!({ "success": true, "recommendationId": rec.id, "plan": plan })))
}

async fn ab_test(
    State(state): State<AppState>,
    payload: Result<Json<RecommendationBody>, JsonRejection>,
) -> ApiResult {
    let rec = body(payload)?.recommendation;
    let design = state.optimizer.design_ab_test(&rec).await;
    Ok(Json(json!({ "success": true, "recommendationId": rec.id, "design": design })))
}

#[derive(Debug, Default, Deserialize)]
struct ContinuousBody {
    metrics: Option<PlatformMetrics>,
}

/// An empty body runs against simulated metrics.
async fn continuous(State(state): State<AppState>, raw: Bytes) -> ApiResult {
    let req: ContinuousBody = if raw.iter().all(u8::is_ascii_whitespace) {
        ContinuousBody::default()
    } else {
        serde_json::from_slice(&raw).map_err(|e| ApiError::bad_request(e.to_string()))?
    };
    let source: &dyn MetricsSource = match &req.metrics {
        Some(m) => m as &dyn MetricsSource,
        None => &SimulatedMetrics,
    };
    let report = state.optimizer.continuous_optimization(source).await?;
    Ok(Json(json!({ "success": true, "report": report })))
}

async fn optimization_history(
    State(state): State<AppState>,
    q: Result<Query<LimitQuery>, QueryRejection>,
) -> ApiResult {
    let q = query(q)?;
    let history = state
        .optimizer
        .history(q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
    Ok(Json(json!({ "success": true, "history": history })))
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

async fn full_analysis(
    State(state): State<AppState>,
    payload: Result<Json<FullAnalysisRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let analysis =
        run_full_analysis(&state.pricing, &state.viral, &state.optimizer, &req).await?;
    Ok(Json(json!({ "success": true, "analysis": analysis })))
}

// ---------------------------------------------------------------------------
// Escrow wallets
// ---------------------------------------------------------------------------

async fn create_escrow(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreateEscrowRequest>, JsonRejection>,
) -> ApiResult {
    let claims = require(state.authorizer.as_ref(), &headers, Capability::EscrowWrite)?;
    let req = body(payload)?;
    let wallet = state.escrow.create_escrow(&req, &claims.subject).await?;
    Ok(Json(json!({ "success": true, "wallet": wallet })))
}

async fn get_wallet(
    State(state): State<AppState>,
    headers: HeaderMap,
    wallet_id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult {
    require(state.authorizer.as_ref(), &headers, Capability::EscrowRead)?;
    let wallet_id = path(wallet_id)?;
    let wallet = state.escrow.get_wallet(wallet_id).await?;
    Ok(Json(json!({ "success": true, "wallet": wallet })))
}

async fn release_escrow(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ReleaseEscrowRequest>, JsonRejection>,
) -> ApiResult {
    let claims = require(state.authorizer.as_ref(), &headers, Capability::EscrowWrite)?;
    let req = body(payload)?;
    let wallet = state.escrow.release_escrow(&req, &claims.subject).await?;
    Ok(Json(json!({ "success": true, "wallet": wallet })))
}

async fn lock_escrow(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<WalletActionRequest>, JsonRejection>,
) -> ApiResult {
    let claims = require(state.authorizer.as_ref(), &headers, Capability::EscrowWrite)?;
    let req = body(payload)?;
    let wallet = state.escrow.lock_escrow(&req, &claims.subject).await?;
    Ok(Json(json!({ "success": true, "wallet": wallet })))
}

async fn dispute_escrow(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<WalletActionRequest>, JsonRejection>,
) -> ApiResult {
    let claims = require(state.authorizer.as_ref(), &headers, Capability::EscrowWrite)?;
    let req = body(payload)?;
    let wallet = state.escrow.dispute_escrow(&req, &claims.subject).await?;
    Ok(Json(json!({ "success": true, "wallet": wallet })))
}

async fn wallet_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    wallet_id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult {
    require(state.authorizer.as_ref(), &headers, Capability::EscrowRead)?;
    let wallet_id = path(wallet_id)?;
    let report = state.escrow.report(wallet_id).await?;
    Ok(Json(json!({ "success": true, "report": report })))
}
