//! Worker subscription endpoints.

use axum::extract::{Extension, Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{QueueError, QueueResult, SubscriptionId};
use crate::kernel::subscriptions::{DeliveryMode, NewSubscription};
use crate::server::app::AppState;
use crate::server::middleware::AuthContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub callback_url: String,
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub min_interval_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResponse {
    pub subscription_id: SubscriptionId,
    pub expires_at: DateTime<Utc>,
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    Json(body): Json<CreateSubscriptionRequest>,
) -> QueueResult<Json<SubscriptionResponse>> {
    let url = reqwest::Url::parse(&body.callback_url)
        .map_err(|_| QueueError::bad_input("callbackUrl must be a valid URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(QueueError::bad_input("callbackUrl must be http or https"));
    }

    let event_types = body
        .event_types
        .filter(|events| !events.is_empty())
        .unwrap_or_else(|| vec!["*".to_string()]);

    let subscription = state
        .subscriptions
        .create(NewSubscription {
            callback_url: body.callback_url,
            event_types,
            delivery_mode: body.delivery_mode.unwrap_or_default(),
            group_id: body.group_id,
            min_interval_seconds: body.min_interval_seconds.unwrap_or(0),
            ttl_seconds: body
                .ttl_seconds
                .unwrap_or(state.config.subscription_default_ttl_seconds),
        })
        .await?;

    Ok(Json(SubscriptionResponse {
        subscription_id: subscription.id,
        expires_at: subscription.expires_at,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionHeartbeatRequest {
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

pub async fn heartbeat_subscription(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<SubscriptionHeartbeatRequest>,
) -> QueueResult<Json<SubscriptionResponse>> {
    let id: SubscriptionId = id
        .parse()
        .map_err(|_| QueueError::bad_input("invalid subscription id"))?;
    let ttl = body
        .ttl_seconds
        .unwrap_or(state.config.subscription_default_ttl_seconds);

    let subscription = state.subscriptions.heartbeat(&id, ttl).await?;
    Ok(Json(SubscriptionResponse {
        subscription_id: subscription.id,
        expires_at: subscription.expires_at,
    }))
}
