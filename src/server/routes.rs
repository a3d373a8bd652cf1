use super::error::ApiError;
use super::identity::CurrentUser;
use crate::engine::scheduler;
use crate::engine::QuotaStatus;
use crate::errors::EngineError;
use crate::paper::tracker;
use crate::state::{AccountLedger, AppState, Settlement, TradeOutcome, TradeRecord, TradingSettings};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use rust_decimal::Decimal;
use std::sync::Arc;

type ApiResult<T> = Result<T, ApiError>;

#[derive(serde::Deserialize)]
pub struct CreateTradeBody {
    pub stake: Decimal,
    pub duration_secs: i64,
    pub settings: Option<TradingSettings>,
}

#[derive(serde::Deserialize)]
pub struct TradesQuery {
    pub limit: Option<usize>,
}

#[derive(serde::Deserialize)]
pub struct OpenPositionBody {
    pub stake: Decimal,
    pub entry_price: Decimal,
}

#[derive(serde::Deserialize)]
pub struct ClosePositionBody {
    pub exit_price: Decimal,
}

#[derive(serde::Deserialize)]
pub struct DepositBody {
    pub amount: Decimal,
}

/// POST /api/trades -- create a timed trade and arm its countdown
pub async fn create_trade(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<CreateTradeBody>,
) -> ApiResult<(StatusCode, Json<TradeRecord>)> {
    let trade = state
        .engine
        .create_timed_trade(&user, body.stake, body.duration_secs, body.settings)
        .await?;
    if let Some(matures_at) = trade.matures_at {
        scheduler::spawn_countdown(state.engine.clone(), trade.id.clone(), matures_at);
    }
    Ok((StatusCode::CREATED, Json(trade)))
}

/// POST /api/trades/{id}/settle -- settle one of the caller's trades
pub async fn settle_trade(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(trade_id): Path<String>,
) -> ApiResult<Json<Settlement>> {
    let trade = state.engine.trade(&trade_id).await?;
    if trade.user_id != user {
        return Err(EngineError::Permission(format!("trade {trade_id} belongs to another user")).into());
    }
    Ok(Json(state.engine.settle(&trade_id).await?))
}

/// POST /api/sweep -- session-start catch-up for the caller
pub async fn sweep(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<serde_json::Value>> {
    let entries = scheduler::catch_up(&state.engine, Some(user.as_str())).await?;
    Ok(Json(serde_json::json!({ "results": entries })))
}

/// GET /api/trades -- recent trades plus summary
pub async fn get_trades(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(params): Query<TradesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = params.limit.unwrap_or(50).min(500);
    let trades = state.engine.trades(&user, limit).await?;
    let summary = tracker::compute_summary(&trades);
    Ok(Json(serde_json::json!({ "trades": trades, "summary": summary })))
}

/// GET /api/account
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<AccountLedger>> {
    Ok(Json(state.engine.account(&user).await?))
}

/// GET /api/quota -- attempts used today and when the window resets
pub async fn get_quota(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<QuotaStatus>> {
    Ok(Json(state.engine.quota_status(&user).await?))
}

/// PUT /api/settings
pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(settings): Json<TradingSettings>,
) -> ApiResult<Json<TradingSettings>> {
    state.engine.update_settings(&user, settings).await?;
    Ok(Json(settings))
}

/// POST /api/positions
pub async fn open_position(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<OpenPositionBody>,
) -> ApiResult<(StatusCode, Json<TradeRecord>)> {
    let position = state
        .engine
        .open_position(&user, body.stake, body.entry_price)
        .await?;
    Ok((StatusCode::CREATED, Json(position)))
}

/// POST /api/positions/{id}/close
pub async fn close_position(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(trade_id): Path<String>,
    Json(body): Json<ClosePositionBody>,
) -> ApiResult<Json<TradeOutcome>> {
    Ok(Json(
        state
            .engine
            .close_position(&user, &trade_id, body.exit_price)
            .await?,
    ))
}

/// POST /api/deposit -- funding hook for the external approval flow
pub async fn deposit(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<DepositBody>,
) -> ApiResult<Json<AccountLedger>> {
    Ok(Json(state.engine.deposit(&user, body.amount).await?))
}

/// GET /api/limits -- request bounds and defaults the UI validates against
pub async fn get_limits(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cfg = &state.config;
    Json(serde_json::json!({
        "min_duration_secs": cfg.min_duration_secs,
        "max_duration_secs": cfg.max_duration_secs,
        "max_daily_attempts": cfg.max_daily_attempts,
        "default_settings": cfg.default_settings,
    }))
}

/// GET /api/counters -- performance counters (lock-free reads)
pub async fn get_counters(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    use portable_atomic::Ordering::Relaxed;
    let c = state.engine.counters();
    Json(serde_json::json!({
        "model": state.engine.model_name(),
        "trades_created": c.trades_created.load(Relaxed),
        "settlements_applied": c.settlements_applied.load(Relaxed),
        "already_settled": c.already_settled.load(Relaxed),
        "positions_closed": c.positions_closed.load(Relaxed),
        "quota_rejections": c.quota_rejections.load(Relaxed),
        "sweeps_run": c.sweeps_run.load(Relaxed),
        "sweeps_skipped": c.sweeps_skipped.load(Relaxed),
        "retries": state.engine.retries(),
        "ws_messages_sent": c.ws_messages_sent.load(Relaxed),
    }))
}
