pub mod events;
pub mod health;

pub use events::create_event;
pub use health::healthz;

use axum::http::Uri;

use crate::error::ApiError;

/// Fallback for unknown routes
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("No route for {}", uri.path()))
}
