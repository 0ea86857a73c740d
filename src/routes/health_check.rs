use actix_web::HttpResponse;

/// Liveness probe; deliberately db-free so a saturated pool does not flap
/// the load balancer.
pub async fn health_check() -> HttpResponse { HttpResponse::Ok().finish() }
