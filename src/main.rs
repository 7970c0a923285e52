use salvo::catcher::Catcher;
use salvo::prelude::*;
use salvo::server::ServerHandle;
use tokio::signal;
use tracing::info;

mod auth;
mod client;
mod codec;
mod config;
mod error;
mod hoops;
mod hub;
mod prelude;
mod routers;
mod utils;

pub use error::ApiError;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    config::init();
    let cfg = config::get();

    let _guard = cfg.log.guard();
    tracing::info!("log level: {}", &cfg.log.filter_level);

    utils::limiter::periodic_rate_limit_report();
    // touches the global hub so the heartbeat loop is running before the
    // first request arrives
    let _ = hub::Hub::global();

    let service = Service::new(routers::root()).catcher(Catcher::default());
    let acceptor = TcpListener::new((cfg.listen_addr.as_str(), cfg.listen_port))
        .bind()
        .await;
    let server = Server::new(acceptor);

    println!("🚀 Server listening on http://{}:{}/", cfg.listen_addr, cfg.listen_port);
    tokio::spawn(shutdown_signal(server.handle()));
    server.serve(service).await;
}

async fn shutdown_signal(handle: ServerHandle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl_c signal received"),
        _ = terminate => info!("terminate signal received"),
    }
    hub::Hub::global().shutdown().await;
    handle.stop_graceful(std::time::Duration::from_secs(10));
}

#[cfg(test)]
mod tests {
    use salvo::prelude::*;
    use salvo::test::TestClient;

    use crate::{config, hub};

    fn init() {
        let _ = config::init_test();
        hub::Hub::reset();
    }

    #[tokio::test]
    async fn sse_endpoint_streams_a_connected_event_first() {
        init();
        let service = Service::new(crate::routers::root());

        let response = TestClient::get("http://127.0.0.1/api/sse")
            .send(&service)
            .await;
        assert_eq!(response.status_code, Some(salvo::http::StatusCode::OK));
    }

    #[tokio::test]
    async fn stats_endpoint_reports_zero_connections_on_a_fresh_hub() {
        init();
        let service = Service::new(crate::routers::root());

        let mut response = TestClient::get("http://127.0.0.1/api/sse/stats")
            .send(&service)
            .await;
        let body: serde_json::Value = response.take_json().await.unwrap();
        assert_eq!(body["stats"]["totalConnections"], 0);
    }

    #[tokio::test]
    async fn notifications_endpoint_rejects_empty_event_type() {
        init();
        let service = Service::new(crate::routers::root());

        let response = TestClient::post("http://127.0.0.1/api/sse/notifications")
            .json(&serde_json::json!({"eventType": "", "data": {"n": 1}}))
            .send(&service)
            .await;
        assert_eq!(
            response.status_code,
            Some(salvo::http::StatusCode::BAD_REQUEST)
        );
    }

    #[tokio::test]
    async fn notifications_endpoint_broadcasts_with_zero_listeners() {
        init();
        let service = Service::new(crate::routers::root());

        let mut response = TestClient::post("http://127.0.0.1/api/sse/notifications")
            .json(&serde_json::json!({"eventType": "t", "data": {"n": 1}}))
            .send(&service)
            .await;
        let body: serde_json::Value = response.take_json().await.unwrap();
        assert_eq!(body["sent"], 0);
        assert_eq!(body["failed"], 0);
    }
}
