use salvo::oapi::security::{ApiKey, ApiKeyValue, SecurityScheme};

use crate::prelude::*;

pub mod notifications;
pub mod sse;
pub mod stats;

const OPENAPI_JSON: &str = "/api-doc/openapi.json";

pub fn root() -> Router {
    let api_routes = Router::with_path("api")
        .hoop(crate::utils::logger::Logger)
        .hoop(Timeout::new(std::time::Duration::from_secs(30)))
        .append(&mut vec![sse::router(), notifications::router(), stats::router()]);

    let doc = openapi_doc(&api_routes);

    Router::new()
        .push(api_routes)
        .unshift(doc.into_router(OPENAPI_JSON))
        .unshift(Scalar::new(OPENAPI_JSON).into_router("scalar"))
        .unshift(SwaggerUi::new(OPENAPI_JSON).into_router("swagger-ui"))
        .unshift(RapiDoc::new(OPENAPI_JSON).into_router("rapidoc"))
        .unshift(ReDoc::new(OPENAPI_JSON).into_router("redoc"))
}

fn openapi_doc(to_document: &Router) -> OpenApi {
    OpenApi::new("SSE Hub API", "0.1.0")
        .add_security_scheme(
            "jwt",
            SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                crate::auth::JWT_COOKIE_NAME,
                "Optional JWT cookie used to resolve a caller identity for \
                 /api/sse and /api/sse/notifications. Absence resolves to an \
                 anonymous identity; whether that is accepted is a \
                 deployment policy (require_auth_sse / require_auth_notify).",
            ))),
        )
        .merge_router(to_document)
}
