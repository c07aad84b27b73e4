use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};

/// `GET /api/v1/view`: the complete current view, as pushed on `/ws/view`.
pub async fn get_view(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.view().snapshot()))
}
