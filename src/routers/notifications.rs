//! `POST /api/sse/notifications` — the one producer-facing REST endpoint
//! (§4.4, §6).

use crate::codec::Event;
use crate::hoops::DepotAuthExt;
use crate::hub::Hub;
use crate::prelude::*;

pub fn router() -> Router {
    Router::with_path("sse/notifications")
        .hoop(crate::hoops::auth_hoop)
        .user_rate_limit(&RateLimit::per_minute(120))
        .post(notify)
        .options(preflight)
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
struct NotifyTarget {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
struct NotifyOptions {
    id: Option<String>,
    retry: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema, Validate)]
struct NotifyRequest {
    #[serde(rename = "eventType")]
    #[validate(length(min = 1, message = "eventType must not be empty"))]
    event_type: String,
    data: serde_json::Value,
    target: Option<NotifyTarget>,
    options: Option<NotifyOptions>,
}

#[derive(Debug, Serialize, ToSchema)]
struct NotifyResponse {
    success: bool,
    #[serde(rename = "eventType")]
    event_type: String,
    sent: u64,
    failed: u64,
    message: String,
}

/// Accepts `{eventType, data, target?, options?}` and routes it through the
/// hub, returning how many live connections received it.
#[endpoint(tags("sse"))]
async fn notify(
    depot: &mut Depot,
    body: JsonBody<NotifyRequest>,
) -> AppResult<Json<NotifyResponse>> {
    let identity = depot.auth_identity();
    if crate::config::get().require_auth_notify && !identity.is_authenticated() {
        return Err(ApiError::Unauthenticated);
    }

    let request = body.into_inner();
    request
        .validate()
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let NotifyRequest {
        event_type,
        data,
        target,
        options,
    } = request;

    if data.is_null() {
        return Err(ApiError::InvalidRequest("data must not be empty".into()));
    }

    let mut event = Event::new(event_type.clone(), data);
    if let Some(opts) = options {
        if let Some(id) = opts.id {
            event = event.with_id(id);
        }
        if let Some(retry) = opts.retry {
            event = event.with_retry(retry);
        }
    }

    let hub = Hub::global();
    let result = match target.and_then(|t| t.user_id) {
        Some(user_id) => hub.send_to_user(&user_id, &event).await,
        None => hub.broadcast(&event).await,
    };

    json_ok(NotifyResponse {
        success: true,
        event_type,
        sent: result.sent,
        failed: result.failed,
        message: format!("delivered to {} connection(s), {} failed", result.sent, result.failed),
    })
}

#[endpoint]
async fn preflight(res: &mut Response) {
    res.headers_mut().insert(
        "Access-Control-Allow-Methods",
        "GET, POST, OPTIONS".parse().unwrap(),
    );
    res.headers_mut().insert(
        "Access-Control-Allow-Headers",
        "Cache-Control, Content-Type".parse().unwrap(),
    );
    res.headers_mut()
        .insert("Access-Control-Allow-Origin", "*".parse().unwrap());
    res.status_code(salvo::http::StatusCode::OK);
}
