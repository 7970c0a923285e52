//! `GET /api/sse` — upgrades an HTTP GET into a long-lived event stream
//! (§4.4). Grounded in the donor's `stream::connect_stream` for the
//! admission/metadata-building shape, adapted from a WebTransport CONNECT
//! handler to a plain streaming GET response.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::auth::device_and_ip;
use crate::hoops::DepotAuthExt;
use crate::hub::Hub;
use crate::prelude::*;

pub fn router() -> Router {
    Router::with_path("sse")
        .hoop(crate::hoops::auth_hoop)
        .ip_rate_limit(&RateLimit::per_minute(60))
        .get(connect)
        .options(preflight)
}

/// Upgrades the request into a `text/event-stream` response.
#[endpoint(tags("sse"))]
async fn connect(req: &mut Request, depot: &mut Depot, res: &mut Response) -> AppResult<()> {
    let identity = depot.auth_identity();
    if crate::config::get().require_auth_sse && !identity.is_authenticated() {
        return Err(ApiError::Unauthenticated);
    }

    let (device, ip) = device_and_ip(req);
    let session_id = req
        .query::<String>("sessionId")
        .unwrap_or_else(|| derive_session_id(identity.user_id.as_deref(), ip.as_deref(), device.as_deref()));

    let mut metadata = HashMap::new();
    if let Some(device) = device {
        metadata.insert("userAgent".to_string(), device);
    }
    if let Some(ip) = ip {
        metadata.insert("ip".to_string(), ip);
    }
    metadata.insert(
        "isAuthenticated".to_string(),
        identity.is_authenticated().to_string(),
    );
    metadata.insert(
        "connectionTime".to_string(),
        chrono::Utc::now().to_rfc3339(),
    );
    for (key, value) in req.queries() {
        if key != "sessionId" {
            metadata.insert(key.clone(), value.clone());
        }
    }

    let hub = Hub::global();
    let (conn, rx) = hub
        .create_connection(identity.user_id.clone(), Some(session_id), metadata)
        .await?;

    res.headers_mut()
        .insert("Content-Type", "text/event-stream".parse().unwrap());
    res.headers_mut()
        .insert("Cache-Control", "no-cache".parse().unwrap());
    res.headers_mut()
        .insert("Connection", "keep-alive".parse().unwrap());
    res.headers_mut()
        .insert("Access-Control-Allow-Origin", "*".parse().unwrap());
    res.headers_mut()
        .insert("Access-Control-Allow-Headers", "Cache-Control".parse().unwrap());

    let guard = DisconnectGuard {
        inner: ReceiverStream::new(rx),
        hub,
        connection_id: conn.id.clone(),
    };
    res.stream(guard.map(Ok::<_, std::io::Error>));
    Ok(())
}

/// Wraps the per-connection byte stream so that whenever Salvo drops the
/// response body (end of stream, client cancellation, anything else) the
/// connection is deregistered exactly once. `remove_connection` is itself
/// idempotent, so this never double-counts against a reap that already
/// happened via a failed heartbeat write.
struct DisconnectGuard {
    inner: ReceiverStream<Bytes>,
    hub: Arc<Hub>,
    connection_id: String,
}

impl Stream for DisconnectGuard {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.hub.remove_connection(&self.connection_id);
    }
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

fn derive_session_id(user_id: Option<&str>, ip: Option<&str>, ua: Option<&str>) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    match user_id {
        Some(uid) => format!("auth_{uid}_{millis}"),
        None => {
            let raw = format!("{}|{}|{millis}", ip.unwrap_or(""), ua.unwrap_or(""));
            let encoded = URL_SAFE_NO_PAD.encode(raw);
            format!("anon_{}", &encoded[..encoded.len().min(16)])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_session_id_is_stable_in_shape_for_authenticated_callers() {
        let id = derive_session_id(Some("u1"), None, None);
        assert!(id.starts_with("auth_u1_"));
    }

    #[test]
    fn derive_session_id_for_anonymous_caller_is_short_and_prefixed() {
        let id = derive_session_id(None, Some("127.0.0.1"), Some("curl"));
        assert!(id.starts_with("anon_"));
        assert!(id.len() <= "anon_".len() + 16);
    }
}
