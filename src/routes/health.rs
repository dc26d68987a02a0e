// src/routes/health.rs

use actix_web::{get, web, HttpResponse, Scope};
use metrics_exporter_prometheus::PrometheusHandle;

#[get("/health")]
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Prometheus text exposition; 503 when no recorder was installed.
#[get("/metrics")]
async fn metrics(handle: Option<web::Data<PrometheusHandle>>) -> HttpResponse {
    match handle {
        Some(h) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(h.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

pub fn health_scope() -> Scope {
    web::scope("")
        .service(health_check)
        .service(metrics)
}
