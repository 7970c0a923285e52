use salvo::http::StatusCode;
use salvo::oapi::{self, EndpointOutRegister, ToSchema};
use salvo::prelude::*;
use thiserror::Error;

/// Error kinds surfaced across the HTTP boundary, per the error design in §7.
///
/// Errors that are purely internal to a single connection's lifecycle
/// (`WriteFailed`, `CloseRace`) never reach this type — they are handled by
/// eviction inside [`crate::hub`] and are not rendered to any caller.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("the hub has reached its connection capacity")]
    CapacityExceeded,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("authentication required")]
    Unauthenticated,
}

pub type AppResult<T> = Result<T, ApiError>;

impl Scribe for ApiError {
    fn render(self, res: &mut Response) {
        let (status, message) = match &self {
            Self::CapacityExceeded => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            Self::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            Self::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
        };
        tracing::warn!(%status, error = %message, "request rejected");
        res.status_code(status);
        res.render(Json(ErrorBody { error: message }));
    }
}

#[derive(serde::Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

impl EndpointOutRegister for ApiError {
    fn register(
        components: &mut oapi::Components,
        operation: &mut oapi::Operation,
    ) {
        let responses = [
            (StatusCode::BAD_REQUEST, "Missing eventType or data"),
            (StatusCode::UNAUTHORIZED, "Authentication required"),
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Hub has reached its connection capacity",
            ),
        ];

        for (status, description) in responses {
            operation.responses.insert(
                status.as_str(),
                oapi::Response::new(description)
                    .add_content("application/json", ErrorBody::to_schema(components)),
            );
        }
    }
}
