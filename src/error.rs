use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use mongodb::bson::doc;
use thiserror::Error;
use tracing::error;

use crate::store::StoreError;

pub const PRODUCT_NOT_FOUND_MESSAGE: &str = "Make sure your product ID is correct";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("requester is not an administrator")]
    NotAdmin,

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("product {0} not found")]
    ProductNotFound(String),

    #[error("invalid upload: {0}")]
    Upload(String),

    #[error("upload exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("file storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownCategory(id) => ApiError::Validation(vec![format!(
                "category_id {} does not reference an existing category",
                id
            )]),
            other => {
                error!("Store failure: {}", other);
                ApiError::Store(other)
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::Upload(_) => StatusCode::BAD_REQUEST,
            ApiError::NotAdmin | ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::ProductNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Store(_) | ApiError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        match self {
            ApiError::Validation(violations) => response.json(doc! { "error": violations }),
            ApiError::Upload(message) => response.json(doc! { "error": [message] }),
            ApiError::NotAdmin => response.finish(),
            ApiError::Unauthenticated(message) => response.json(doc! { "error": message }),
            ApiError::ProductNotFound(_) => {
                response.json(doc! { "error": PRODUCT_NOT_FOUND_MESSAGE })
            }
            ApiError::PayloadTooLarge(_) => response.json(doc! { "error": self.to_string() }),
            ApiError::Store(_) | ApiError::Storage(_) => {
                response.json(doc! { "error": "Internal server error" })
            }
        }
    }
}
