use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use mesa_agent::{
    CommandAgent, GuardrailPolicy, IntakeError, IntakeSettings, ReservationAgent, ToolExecutor,
    WebhookIntakeCoordinator,
};
use mesa_core::clock::Clock;
use mesa_core::config::AppConfig;
use mesa_core::domain::reservation::{parse_date, ReservationStatus};
use mesa_core::domain::schedule::ServiceHours;
use mesa_core::errors::InterfaceError;
use mesa_db::{
    DateRange, KeyValueStore, ReservationStore, ReservationStoreSettings, SessionStore,
    SessionStoreSettings, StatsFacade,
};
use mesa_whatsapp::inbound::normalize_sender;
use mesa_whatsapp::{reply_twiml, Inbound, InboundForm, TWIML_CONTENT_TYPE};

use crate::health;

/// Days before and after today covered by `/stats` when no range is given.
pub const STATS_LOOKBACK_DAYS: u64 = 30;
pub const STATS_LOOKAHEAD_DAYS: u64 = 90;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub reservations: ReservationStore,
    pub coordinator: WebhookIntakeCoordinator,
    pub stats: StatsFacade,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let reservations = ReservationStore::new(
            store.clone(),
            clock.clone(),
            ReservationStoreSettings::from(&config.reservations),
        );
        let sessions =
            SessionStore::new(store.clone(), clock.clone(), SessionStoreSettings::from(&config.session));

        let executor =
            ToolExecutor::new(reservations.clone(), ServiceHours::default(), GuardrailPolicy::default());
        let agent: Arc<dyn ReservationAgent> =
            Arc::new(CommandAgent::new(config.agent.restaurant_name.clone()));
        let coordinator = WebhookIntakeCoordinator::new(
            sessions.clone(),
            executor,
            agent,
            IntakeSettings::from(&config),
        );
        let stats = StatsFacade::new(reservations.clone(), sessions);

        Self { config: Arc::new(config), store, clock, reservations, coordinator, stats }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health::health))
        .route("/webhook", post(webhook))
        .route("/whatsapp", post(webhook))
        .route("/stats", get(stats))
        .route("/admin/clear-session", post(clear_session))
        .route("/test-message", post(test_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub error: &'static str,
    /// Only input problems are echoed back; everything else stays in the logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
}

fn error_response(error: InterfaceError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(
            event_name = "http.error_response",
            correlation_id = %error.correlation_id(),
            status = status.as_u16(),
            error = %error,
            "request failed"
        );
    } else {
        info!(
            event_name = "http.error_response",
            correlation_id = %error.correlation_id(),
            status = status.as_u16(),
            error = %error,
            "request rejected"
        );
    }
    let detail = match &error {
        InterfaceError::BadRequest { message, .. } => Some(message.clone()),
        _ => None,
    };
    let body = ApiError {
        error: error.user_message(),
        detail,
        correlation_id: error.correlation_id().to_string(),
    };
    (status, Json(body)).into_response()
}

fn not_found(correlation_id: String) -> Response {
    error_response(InterfaceError::NotFound { message: "route disabled".to_string(), correlation_id })
}

fn twiml(body: String) -> Response {
    ([(header::CONTENT_TYPE, TWIML_CONTENT_TYPE)], body).into_response()
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

async fn service_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "online",
        "service": format!("{} WhatsApp Bot", state.config.agent.restaurant_name),
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.server.environment.as_str(),
        "timestamp": Utc::now().to_rfc3339(),
        "endpoints": {
            "webhook": "/webhook",
            "health": "/health",
            "stats": "/stats",
        },
    }))
}

/// Provider webhook. Every handled delivery is answered with TwiML; only failures the
/// provider should redeliver (session or store outages) get a non-2xx status.
pub async fn webhook(State(state): State<AppState>, Form(form): Form<InboundForm>) -> Response {
    let correlation_id = correlation_id();
    let max_length = state.config.messaging.max_message_length;

    let inbound = match form.classify() {
        Ok(inbound) => inbound,
        Err(error) => {
            warn!(
                event_name = "http.webhook.rejected",
                correlation_id = %correlation_id,
                error = %error,
                "inbound form rejected"
            );
            return error_response(InterfaceError::BadRequest {
                message: error.to_string(),
                correlation_id,
            });
        }
    };
    let user_id = inbound.user_id().to_string();

    match state.coordinator.handle(inbound).await {
        Ok(outcome) => {
            info!(
                event_name = "http.webhook.answered",
                correlation_id = %correlation_id,
                user_id = %user_id,
                disposition = ?outcome.disposition,
                tools = outcome.tool_results.len(),
                "webhook answered"
            );
            twiml(reply_twiml(&outcome.reply, max_length))
        }
        Err(error @ IntakeError::Agent(_)) => {
            warn!(
                event_name = "http.webhook.agent_failed",
                correlation_id = %correlation_id,
                user_id = %user_id,
                error = %error,
                "agent failed; answering with a notice"
            );
            twiml(reply_twiml(error.user_notice(), max_length))
        }
        Err(error) => {
            error!(
                event_name = "http.webhook.unavailable",
                correlation_id = %correlation_id,
                user_id = %user_id,
                error = %error,
                "webhook could not be processed"
            );
            error_response(InterfaceError::from(error).with_correlation(correlation_id))
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatsBody {
    pub from: String,
    pub to: String,
    pub total_reservations: u64,
    pub today_reservations: u64,
    pub covers: u64,
    pub by_status: BTreeMap<ReservationStatus, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatsResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub stats: StatsBody,
}

pub async fn stats(State(state): State<AppState>, Query(query): Query<StatsQuery>) -> Response {
    let correlation_id = correlation_id();
    let today = state.clock.now().date_naive();

    let range = match stats_range(&query, today) {
        Ok(range) => range,
        Err(error) => return error_response(error.with_correlation(correlation_id)),
    };

    let counts = match state.stats.counts_by_status(range).await {
        Ok(counts) => counts,
        Err(error) => {
            error!(event_name = "http.stats.failed", correlation_id = %correlation_id, error = %error);
            return error_response(InterfaceError::from(error).with_correlation(correlation_id));
        }
    };
    let today_counts = match state.stats.counts_for_date(today).await {
        Ok(counts) => counts,
        Err(error) => {
            error!(event_name = "http.stats.failed", correlation_id = %correlation_id, error = %error);
            return error_response(InterfaceError::from(error).with_correlation(correlation_id));
        }
    };

    Json(StatsResponse {
        status: "success",
        timestamp: Utc::now().to_rfc3339(),
        stats: StatsBody {
            from: range.from.to_string(),
            to: range.to.to_string(),
            total_reservations: counts.total,
            today_reservations: today_counts.total,
            covers: counts.covers,
            by_status: counts.by_status,
        },
    })
    .into_response()
}

fn stats_range(query: &StatsQuery, today: NaiveDate) -> Result<DateRange, InterfaceError> {
    let parse = |raw: &Option<String>, fallback: NaiveDate| -> Result<NaiveDate, InterfaceError> {
        match raw.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => parse_date(raw).map_err(|error| InterfaceError::BadRequest {
                message: error.to_string(),
                correlation_id: String::new(),
            }),
            None => Ok(fallback),
        }
    };

    let from = parse(&query.from, today.checked_sub_days(Days::new(STATS_LOOKBACK_DAYS)).unwrap_or(today))?;
    let to = parse(&query.to, today.checked_add_days(Days::new(STATS_LOOKAHEAD_DAYS)).unwrap_or(today))?;
    Ok(DateRange::new(from, to)?)
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClearSessionForm {
    #[serde(default)]
    pub phone: String,
}

/// Operator reset of a conversation. Disabled in production.
pub async fn clear_session(
    State(state): State<AppState>,
    Form(form): Form<ClearSessionForm>,
) -> Response {
    let correlation_id = correlation_id();
    if state.config.server.environment.is_production() {
        return not_found(correlation_id);
    }
    let Some(user_id) = normalize_sender(&form.phone) else {
        return error_response(InterfaceError::BadRequest {
            message: "phone is required".to_string(),
            correlation_id,
        });
    };

    match state.stats.reset_session(&user_id).await {
        Ok(_) => {
            info!(
                event_name = "http.admin.session_cleared",
                correlation_id = %correlation_id,
                user_id = %user_id,
                "session cleared"
            );
            Json(json!({ "status": "success", "phone": user_id })).into_response()
        }
        Err(error) => {
            error!(event_name = "http.admin.failed", correlation_id = %correlation_id, error = %error);
            error_response(InterfaceError::from(error).with_correlation(correlation_id))
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TestMessageForm {
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub message: String,
}

/// Runs a message through the intake pipeline without a provider delivery id.
/// Disabled in production.
pub async fn test_message(
    State(state): State<AppState>,
    Form(form): Form<TestMessageForm>,
) -> Response {
    let correlation_id = correlation_id();
    if state.config.server.environment.is_production() {
        return not_found(correlation_id);
    }
    let Some(user_id) = normalize_sender(&form.phone) else {
        return error_response(InterfaceError::BadRequest {
            message: "phone is required".to_string(),
            correlation_id,
        });
    };

    let inbound = match form.message.trim() {
        "" => Inbound::Empty { user_id: user_id.clone() },
        content => {
            Inbound::Text { user_id: user_id.clone(), message_id: None, content: content.to_string() }
        }
    };

    let response = match state.coordinator.handle(inbound).await {
        Ok(outcome) => outcome.reply,
        Err(error @ IntakeError::Agent(_)) => error.user_notice().to_string(),
        Err(error) => {
            return error_response(InterfaceError::from(error).with_correlation(correlation_id))
        }
    };

    Json(json!({
        "status": "success",
        "phone": user_id,
        "message": form.message,
        "response": response,
    }))
    .into_response()
}
