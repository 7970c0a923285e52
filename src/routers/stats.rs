//! `GET /api/sse/stats` — operational visibility into the hub (§4.4, §6).

use crate::hub::{Hub, Selector};
use crate::prelude::*;

pub fn router() -> Router {
    Router::with_path("sse/stats")
        .get(stats)
        .options(preflight)
}

#[derive(Debug, Serialize, ToSchema)]
struct ConnectionSummary {
    id: String,
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "isAuthenticated")]
    is_authenticated: bool,
}

#[derive(Debug, Serialize, ToSchema)]
struct RequestInfo {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "showConnections")]
    show_connections: bool,
}

#[derive(Debug, Serialize, ToSchema)]
struct StatsResponse {
    stats: crate::hub::HubStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    connections: Option<Vec<ConnectionSummary>>,
    #[serde(rename = "requestInfo")]
    request_info: RequestInfo,
}

/// Optionally filtered by `userId`/`sessionId`, optionally includes the
/// per-connection list when `showConnections=true` or a filter is given.
#[endpoint(tags("sse"))]
async fn stats(req: &mut Request) -> JsonResult<StatsResponse> {
    let user_id = req.query::<String>("userId");
    let session_id = req.query::<String>("sessionId");
    let show_connections = req.query::<bool>("showConnections").unwrap_or(false);

    let hub = Hub::global();
    let stats = hub.stats();

    let connections = if show_connections || user_id.is_some() || session_id.is_some() {
        let selector = match (&user_id, &session_id) {
            (Some(u), Some(s)) => Selector::user_and_session(u.clone(), s.clone()),
            (Some(u), None) => Selector::user(u.clone()),
            (None, Some(s)) => Selector::session(s.clone()),
            (None, None) => Selector::all(),
        };
        Some(
            hub.connections(&selector)
                .into_iter()
                .map(|c| ConnectionSummary {
                    id: c.id.clone(),
                    user_id: c.user_id.clone(),
                    session_id: c.session_id.clone(),
                    is_authenticated: c.is_authenticated(),
                })
                .collect(),
        )
    } else {
        None
    };

    json_ok(StatsResponse {
        stats,
        connections,
        request_info: RequestInfo {
            user_id,
            session_id,
            show_connections,
        },
    })
}

#[endpoint]
async fn preflight(res: &mut Response) {
    res.headers_mut()
        .insert("Access-Control-Allow-Methods", "GET, OPTIONS".parse().unwrap());
    res.headers_mut().insert(
        "Access-Control-Allow-Headers",
        "Cache-Control, Content-Type".parse().unwrap(),
    );
    res.headers_mut()
        .insert("Access-Control-Allow-Origin", "*".parse().unwrap());
    res.status_code(salvo::http::StatusCode::OK);
}
