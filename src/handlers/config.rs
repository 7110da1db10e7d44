use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The running configuration with engine secrets masked.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = serde_json::to_value(state.config().redacted())
        .map_err(|e| AppError::Internal(format!("failed to serialize configuration: {}", e)))?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}
