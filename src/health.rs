use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let metrics = state.metrics.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "calls": {
            "active": state.metrics.active_sessions(),
            "total": metrics.total_sessions
        },
        "speech": {
            "url": config.speech.url,
            "credentials_configured": !config.speech.api_key.is_empty()
        },
        "functions": state.functions.names()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let offered = metrics.frames_forwarded + metrics.frames_dropped + metrics.frames_silent;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "relay": metrics,
        "derived": {
            "frame_drop_rate": if offered > 0 {
                metrics.frames_dropped as f64 / offered as f64
            } else {
                0.0
            },
            "function_error_rate": if metrics.function_calls > 0 {
                metrics.function_errors as f64 / metrics.function_calls as f64
            } else {
                0.0
            },
            "frames_per_second": if uptime_seconds > 0 {
                metrics.frames_forwarded as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::functions::FunctionRegistry;
    use actix_web::{test as actix_test, App};
    use serde_json::Value;

    #[actix_web::test]
    async fn test_health_reports_active_calls() {
        let state = AppState::new(AppConfig::default(), FunctionRegistry::default(), Value::Null);
        state.metrics.session_opened();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["calls"]["active"], 1);
    }

    #[actix_web::test]
    async fn test_metrics_drop_rate() {
        let state = AppState::new(AppConfig::default(), FunctionRegistry::default(), Value::Null);
        state.metrics.frame_forwarded();
        state.metrics.frame_dropped();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/metrics").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["relay"]["frames_forwarded"], 1);
        assert_eq!(body["derived"]["frame_drop_rate"], 0.5);
    }
}
