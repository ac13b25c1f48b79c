use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::Serialize;

use mesa_core::keys::ItemKey;
use mesa_db::KeyValueStore;

use crate::routes::AppState;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub store: HealthCheck,
    pub checked_at: String,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store = store_check(state.store.as_ref()).await;
    let ready = store.status == "ready";

    let payload = HealthResponse {
        status: if ready { "healthy" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: format!("{} assistant running", state.config.agent.restaurant_name),
        },
        store,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

/// A point read of a key nothing writes; any answer, including "absent", counts as ready.
async fn store_check(store: &dyn KeyValueStore) -> HealthCheck {
    let probe = ItemKey::new("HEALTH", "PROBE");
    match store.get(&probe).await {
        Ok(_) => HealthCheck { status: "ready", detail: "store read succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("store read failed: {error}") }
        }
    }
}
