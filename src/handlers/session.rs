//! Session control endpoints: the user-trigger side of the observer.

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `POST /api/v1/session/start`
///
/// Connects if needed, acquires the audio output, then sends (or queues) the
/// start message. Audio failure is reported in the body, not as an error.
pub async fn start_session(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let report = state.controller.start_session().await;
    info!(
        connection = ?report.connection,
        start = ?report.start,
        audio_ready = report.audio_ready,
        "Start requested"
    );

    Ok(HttpResponse::Accepted().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "report": report
    })))
}

pub async fn connect(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let outcome = state.controller.connect().await;

    Ok(HttpResponse::Accepted().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "outcome": outcome
    })))
}

pub async fn disconnect(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    if !state.controller.disconnect().await {
        return Err(AppError::Conflict("No live connection to close".to_string()));
    }

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Disconnected from simulation server",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// `GET /api/v1/session`: connection, stream counters and playback status.
pub async fn session_status(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let stream = state.controller.stats().await;
    let playback = state.controller.playback().status();
    let view = state.view().snapshot();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connected": view.connected,
        "session_active": view.session_active,
        "status": view.status,
        "stream": stream,
        "playback": playback
    })))
}

/// `POST /api/v1/audio/init`: retry acquiring the audio output without
/// restarting the session.
pub async fn init_audio(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let output = state.controller.playback().init().await?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "output": output
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_disconnect_without_connection_conflicts() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/session/disconnect", web::post().to(disconnect)),
        )
        .await;

        let req = test::TestRequest::post().uri("/session/disconnect").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn test_session_status_before_start() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/session", web::get().to(session_status)),
        )
        .await;

        let req = test::TestRequest::get().uri("/session").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["connected"], false);
        assert_eq!(body["stream"]["state"], "disconnected");
        assert_eq!(body["stream"]["connection_attempts"], 0);
        assert_eq!(body["playback"]["state"], "idle");
    }

    #[actix_web::test]
    async fn test_init_audio_reports_missing_output() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/audio/init", web::post().to(init_audio)),
        )
        .await;

        let req = test::TestRequest::post().uri("/audio/init").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            serde_json::to_value(state.controller.playback().status().output).unwrap(),
            "unavailable"
        );
    }
}
