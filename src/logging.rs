use std::fmt::{Debug, Display};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

const LOG_MODULES: &[&str] = &["due_push", "tower_http"];

pub fn init_logging() {
    let mut env_filter = EnvFilter::from_default_env();

    for module in LOG_MODULES {
        env_filter = env_filter.add_directive(
            format!("{}=info", module)
                .parse()
                .expect("Could not parse logging directive"),
        );
    }

    if std::env::var("LOG_JSON").is_ok() {
        tracing_log::LogTracer::init().expect("Could not bridge log records");

        let subscriber = Registry::default()
            .with(tracing_stackdriver::layer())
            .with(env_filter);

        tracing::subscriber::set_global_default(subscriber)
            .expect("Could not set up global logger");
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("Server misconfigured")]
    Misconfigured,

    #[error("Internal Server Error")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Misconfigured | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type WebResult<T> = std::result::Result<T, ApiError>;

pub trait LogError<T> {
    fn log_error_internal(self) -> WebResult<T>;
    fn log_error_bad_request(self) -> WebResult<T>;
    fn log_error_misconfigured(self) -> WebResult<T>;
}

impl<T, E> LogError<T> for Result<T, E>
where
    E: Debug + Display,
{
    fn log_error_internal(self) -> WebResult<T> {
        match self {
            Ok(v) => Ok(v),
            Err(error) => {
                tracing::error!(?error, "Error: {:?}", error);

                Err(ApiError::Internal)
            }
        }
    }

    fn log_error_bad_request(self) -> WebResult<T> {
        match self {
            Ok(v) => Ok(v),
            Err(error) => {
                tracing::warn!(?error, "Bad request: {:?}", error);

                Err(ApiError::BadRequest(error.to_string()))
            }
        }
    }

    fn log_error_misconfigured(self) -> WebResult<T> {
        match self {
            Ok(v) => Ok(v),
            Err(error) => {
                tracing::error!(?error, "Misconfigured: {:?}", error);

                Err(ApiError::Misconfigured)
            }
        }
    }
}
