use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use td_core::crypto::{self, generate_session_token, hash_token};
use td_core::types::{OtpPurpose, Session, User};
use td_core::validation::{
    mask_phone, normalize_phone, validate_email, validate_length, validate_password,
};

use super::state::ApiState;
use super::types::{
    LoginRequest, OtpRequest, OtpResponse, PasswordResetRequest, RegisterRequest,
    RegisterResponse, UpdateProfileRequest, VerifyPhoneRequest,
};
use crate::api_error::ApiError;
use crate::auth::{clear_session_cookie, cookie_value, session_cookie, CurrentUser, SESSION_COOKIE};
use crate::rate_limit_middleware::ClientIp;
use crate::side_effects::send_sms;

const REFERRAL_CODE_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run PBKDF2 off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::InternalError(format!("blocking task failed: {e}")))
}

fn trimmed_email(email: Option<&str>) -> Result<Option<String>, ApiError> {
    match email.map(str::trim).filter(|e| !e.is_empty()) {
        Some(e) => {
            validate_email(e)?;
            Ok(Some(e.to_string()))
        }
        None => Ok(None),
    }
}

async fn deliver_code(state: &ApiState, phone: &str, code: &str) {
    let minutes = (state.config.auth.otp_ttl_secs / 60).max(1);
    let text = format!("Your tourdesk code: {code}. It is valid for {minutes} min.");
    send_sms(state.sms.as_ref(), phone, &text).await;
}

/// Create a session for `user` and answer with the user plus its cookie.
async fn start_session(state: &ApiState, user: User) -> Result<Response, ApiError> {
    let token = generate_session_token()?;
    let ttl_hours = state.config.auth.session_ttl_hours;
    let now = Utc::now();
    let session = Session {
        token_hash: hash_token(&token),
        user_id: user.id,
        created_at: now,
        expires_at: now + Duration::hours(ttl_hours as i64),
    };
    state.store.create_session(&session).await?;
    let cookie = session_cookie(&token, ttl_hours * 3600, state.config.server.secure_cookies)?;
    info!(user_id = %user.id, "session started");
    Ok(([(header::SET_COOKIE, cookie)], Json(user)).into_response())
}

// ---------------------------------------------------------------------------
// Registration and OTP
// ---------------------------------------------------------------------------

/// Second limiter key for the `otp` and `login` namespaces, so guesses
/// against one number are capped however many addresses they come from.
fn phone_key(phone: &str) -> String {
    format!("phone:{phone}")
}

/// POST /api/auth/register -- create an unverified client account and send
/// the phone verification code.
pub(crate) async fn register(
    State(state): State<Arc<ApiState>>,
    ClientIp(ip): ClientIp,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    state.limiter.check("otp", &ip)?;

    let phone = normalize_phone(&req.phone)?;
    state.limiter.check("otp", &phone_key(&phone))?;
    validate_length("name", &req.name, 1, 100)?;
    validate_password(&req.password, state.config.auth.password_min_length)?;
    let email = trimmed_email(req.email.as_deref())?;

    let referred_by = match req.referral_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => {
            let referrer = state
                .store
                .get_user_by_referral_code(&code.to_uppercase())
                .await?
                .ok_or_else(|| ApiError::BadRequest("unknown referral code".into()))?;
            Some(referrer.id)
        }
        _ => None,
    };

    let password = req.password;
    let hash = blocking(move || crypto::hash_password(&password)).await??;
    let mut user = User::new(
        phone,
        req.name.trim(),
        hash,
        crypto::generate_code(REFERRAL_CODE_LEN)?,
    );
    user.email = email;
    user.referred_by = referred_by;
    state.store.create_user(&user).await?;
    info!(user_id = %user.id, phone = %mask_phone(&user.phone), referred = referred_by.is_some(), "account registered");

    let issued = state.otp.issue(&user.phone, OtpPurpose::VerifyPhone).await?;
    deliver_code(&state, &user.phone, &issued.code).await;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user,
            otp_expires_at: issued.expires_at,
        }),
    ))
}

/// POST /api/auth/otp -- (re)send a one-time code.
pub(crate) async fn request_otp(
    State(state): State<Arc<ApiState>>,
    ClientIp(ip): ClientIp,
    Json(req): Json<OtpRequest>,
) -> Result<Json<OtpResponse>, ApiError> {
    state.limiter.check("otp", &ip)?;
    let phone = normalize_phone(&req.phone)?;
    state.limiter.check("otp", &phone_key(&phone))?;
    let user = state.store.get_user_by_phone(&phone).await?;

    match (req.purpose, user) {
        (OtpPurpose::ResetPassword, None) => {
            debug!(phone = %mask_phone(&phone), "reset code requested for unknown phone");
            return Ok(Json(OtpResponse { accepted: true }));
        }
        (OtpPurpose::VerifyPhone, None) => return Err(ApiError::not_found("account")),
        (OtpPurpose::VerifyPhone, Some(u)) if u.phone_verified => {
            return Err(ApiError::Conflict("phone number already verified".into()));
        }
        _ => {}
    }

    let issued = state.otp.issue(&phone, req.purpose).await?;
    deliver_code(&state, &phone, &issued.code).await;
    Ok(Json(OtpResponse { accepted: true }))
}

/// POST /api/auth/verify -- confirm the phone number and sign in.
pub(crate) async fn verify_phone(
    State(state): State<Arc<ApiState>>,
    ClientIp(ip): ClientIp,
    Json(req): Json<VerifyPhoneRequest>,
) -> Result<Response, ApiError> {
    state.limiter.check("otp", &ip)?;
    let phone = normalize_phone(&req.phone)?;
    state.limiter.check("otp", &phone_key(&phone))?;
    let user = state
        .store
        .get_user_by_phone(&phone)
        .await?
        .ok_or_else(|| ApiError::not_found("account"))?;

    state
        .otp
        .verify(&phone, OtpPurpose::VerifyPhone, req.code.trim())
        .await?;
    state.store.mark_phone_verified(user.id).await?;
    info!(user_id = %user.id, "phone verified");

    let user = state
        .store
        .get_user(user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("account"))?;
    start_session(&state, user).await
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// POST /api/auth/login
pub(crate) async fn login(
    State(state): State<Arc<ApiState>>,
    ClientIp(ip): ClientIp,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    state.limiter.check("login", &ip)?;
    let phone = normalize_phone(&req.phone)?;
    state.limiter.check("login", &phone_key(&phone))?;
    let user = state.store.get_user_by_phone(&phone).await?;

    let user = match user {
        Some(user) => {
            let password = req.password;
            let stored = user.password_hash.clone();
            let ok = blocking(move || crypto::verify_password(&password, &stored)).await?;
            ok.then_some(user)
        }
        None => None,
    };
    let Some(user) = user else {
        warn!(phone = %mask_phone(&phone), "failed login");
        return Err(ApiError::Unauthorized("invalid phone number or password".into()));
    };
    if !user.phone_verified {
        return Err(ApiError::Forbidden("phone number is not verified".into()));
    }
    start_session(&state, user).await
}

/// POST /api/auth/logout
pub(crate) async fn logout(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Some(token) = cookie_value(&headers, SESSION_COOKIE) {
        state.store.delete_session(&hash_token(&token)).await?;
    }
    info!(user_id = %user.id, "signed out");
    let cookie = clear_session_cookie(state.config.server.secure_cookies);
    Ok((StatusCode::NO_CONTENT, [(header::SET_COOKIE, cookie)]).into_response())
}

/// POST /api/auth/password/reset -- set a new password with a reset code.
/// Every existing session of the account is revoked.
pub(crate) async fn reset_password(
    State(state): State<Arc<ApiState>>,
    ClientIp(ip): ClientIp,
    Json(req): Json<PasswordResetRequest>,
) -> Result<StatusCode, ApiError> {
    state.limiter.check("otp", &ip)?;
    let phone = normalize_phone(&req.phone)?;
    state.limiter.check("otp", &phone_key(&phone))?;
    validate_password(&req.new_password, state.config.auth.password_min_length)?;

    state
        .otp
        .verify(&phone, OtpPurpose::ResetPassword, req.code.trim())
        .await?;
    let user = state
        .store
        .get_user_by_phone(&phone)
        .await?
        .ok_or_else(|| ApiError::not_found("account"))?;

    let password = req.new_password;
    let hash = blocking(move || crypto::hash_password(&password)).await??;
    state.store.set_password_hash(user.id, &hash).await?;
    // The code arrived by SMS, which proves ownership of the number.
    if !user.phone_verified {
        state.store.mark_phone_verified(user.id).await?;
    }
    let revoked = state.store.delete_user_sessions(user.id).await?;
    info!(user_id = %user.id, revoked, "password reset");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// GET /api/auth/me
pub(crate) async fn me(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

/// PATCH /api/auth/me -- change name and/or email. An empty email clears it.
pub(crate) async fn update_me(
    State(state): State<Arc<ApiState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<User>, ApiError> {
    let name = match req.name {
        Some(name) => {
            validate_length("name", &name, 1, 100)?;
            Some(name.trim().to_string())
        }
        None => None,
    };
    let email = match req.email {
        Some(email) => Some(trimmed_email(Some(&email))?.unwrap_or_default()),
        None => None,
    };
    let updated = state.store.update_profile(user.id, name, email).await?;
    Ok(Json(updated))
}
