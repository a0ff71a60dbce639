//! Identity hand-off from the auth gateway.
//!
//! The gateway owns sessions and credentials. For every request it forwards the user's id and
//! role with an HMAC-SHA256 signature over `"{id}:{role}"`, keyed with the shared
//! `IDENTITY_SECRET`. Nothing here ever sees a password or a cookie.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::request::Parts;
use http::{HeaderMap, StatusCode};
use ring::hmac::{self, Key};

use crate::api::server::{AppState, RouteError};
use crate::db::prelude::{CurrentUser, Role, UserId};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const IDENTITY_SIGNATURE_HEADER: &str = "x-identity-signature";

pub fn identity_key(secret: &str) -> Key {
    Key::new(hmac::HMAC_SHA256, secret.as_bytes())
}

fn identity_message(id: &str, role: &str) -> Vec<u8> {
    format!("{id}:{role}").into_bytes()
}

/// Hex signature the gateway sends for `(id, role)`
pub fn sign_identity(key: &Key, id: UserId, role: Role) -> String {
    let message = identity_message(&id.to_string(), role.as_str());
    hex::encode(hmac::sign(key, &message))
}

pub async fn verify_identity(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, RouteError> {
    let (id, role, signature) = get_identity_parts(req.headers())?;

    let signature =
        hex::decode(signature).map_err(|_| RouteError::AuthError(StatusCode::BAD_REQUEST))?;
    if hmac::verify(&state.identity_key, &identity_message(id, role), &signature).is_err() {
        tracing::warn!(user_id = id, "identity signature mismatch");
        return Err(RouteError::AuthError(StatusCode::UNAUTHORIZED));
    }

    let user_id = id
        .parse::<i64>()
        .map(UserId)
        .map_err(|_| RouteError::AuthError(StatusCode::BAD_REQUEST))?;

    let user = state
        .store
        .get_user(user_id)
        .await?
        .ok_or(RouteError::AuthError(StatusCode::UNAUTHORIZED))?;

    // a signature minted before a role change or deactivation is no longer good
    if !user.is_active {
        return Err(RouteError::AuthError(StatusCode::FORBIDDEN));
    }
    if user.role.as_str() != role {
        return Err(RouteError::AuthError(StatusCode::UNAUTHORIZED));
    }

    req.extensions_mut().insert(CurrentUser::from(&user));
    Ok(next.run(req).await)
}

type IdentityParts<'a> = (&'a str, &'a str, &'a str);
fn get_identity_parts(headers: &HeaderMap) -> Result<IdentityParts<'_>, RouteError> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .ok_or(RouteError::AuthError(StatusCode::UNAUTHORIZED))
    };

    Ok((
        get(USER_ID_HEADER)?,
        get(USER_ROLE_HEADER)?,
        get(IDENTITY_SIGNATURE_HEADER)?,
    ))
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .copied()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}
