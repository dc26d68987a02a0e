// src/routes/status.rs

use actix_web::{get, web, HttpResponse, Responder, Scope};

use crate::{
    services::scheduler::{InstrumentStatus, StatusRegistry},
    utils::types::ApiResponse,
};

#[get("/status")]
pub async fn status(registry: web::Data<StatusRegistry>) -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::<Vec<InstrumentStatus>>::ok(registry.snapshot()))
}

#[get("/status/{instrument}")]
pub async fn instrument_status(
    path: web::Path<String>,
    registry: web::Data<StatusRegistry>,
) -> impl Responder {
    let instrument = path.into_inner();
    match registry.get(&instrument) {
        Some(s) => HttpResponse::Ok().json(ApiResponse::ok(s)),
        None => HttpResponse::NotFound().json(ApiResponse::err(format!("unknown instrument {instrument}"))),
    }
}

pub fn status_scope() -> Scope {
    web::scope("/api")
        .service(status)
        .service(instrument_status)
}
