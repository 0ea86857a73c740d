use actix_web::body::MessageBody;
use actix_web::dev::ServiceRequest;
use actix_web::dev::ServiceResponse;
use actix_web::error::InternalError;
use actix_web::http::header::AUTHORIZATION;
use actix_web::web::Data;
use actix_web::HttpResponse;
use actix_web_lab::middleware::Next;
use argon2::password_hash::SaltString;
use argon2::Argon2;
use argon2::PasswordHasher;
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::ExposeSecret;
use secrecy::Secret;

use crate::utils::error_500;

/// Bearer token expected on the task control endpoints. Wrapped so `Data`
/// does not conflict with other `Secret<String>`s in the app.
#[derive(Clone)]
pub struct AdminToken(pub Secret<String>);

/// Middleware for the `/provisioning` scope: only the operator's
/// administrative token may query or replay tasks. There is no per-user
/// login here; dashboards live in a separate application.
pub async fn reject_non_admin(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let expected = req
        .app_data::<Data<AdminToken>>()
        .ok_or_else(|| error_500(anyhow::anyhow!("admin token not configured")))?
        .clone();

    let supplied = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match supplied {
        Some(token) if token == expected.0.expose_secret().as_str() => next.call(req).await,
        _ => {
            let resp = HttpResponse::Unauthorized().finish();
            let err = anyhow::anyhow!("administrative token required");
            Err(InternalError::from_response(err, resp).into())
        }
    }
}

/// Fresh temporary secret for a new customer: 20 alphanumeric chars from the
/// thread CSPRNG, ~119 bits of entropy. Only ever transmitted once, inside
/// the welcome notification.
pub fn generate_temporary_password() -> Secret<String> {
    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    Secret::new(password)
}

/// Argon2id PHC string with OWASP-recommended params (19 MiB, t=2, p=1).
/// CPU-bound; callers on the request path should wrap this in
/// `spawn_blocking_with_tracing`.
pub fn hash_password(password: &Secret<String>) -> Result<String, anyhow::Error> {
    let salt = SaltString::generate(&mut rand::thread_rng());
    let hash = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(19456, 2, 1, None).map_err(|e| anyhow::anyhow!("{e}"))?,
    )
    .hash_password(password.expose_secret().as_bytes(), &salt)
    .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?
    .to_string();
    Ok(hash)
}
