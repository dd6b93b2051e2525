use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use uuid::Uuid;

use crate::auth::hash_access_token;
use crate::error::ApiError;
use crate::models::{AppState, role_to_string};

/// Operator behind a request. Sessions are issued by the clinic app and
/// looked up here by token hash.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: i16,
    pub session_token_id: Uuid,
}

impl AuthContext {
    pub fn role_name(&self) -> String {
        role_to_string(self.role)
    }
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            // Extract Authorization: Bearer <token>
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;

            let token_hash = hash_access_token(authz.token());

            let user = state
                .store
                .session_user(&token_hash)
                .await?
                .ok_or_else(ApiError::session_expired)?;

            Ok(AuthContext {
                user_id: user.user_id,
                role: user.role,
                session_token_id: user.session_token_id,
            })
        }
    }
}

// roles: 0 patient, 1 admin, 2 manager, 3 doctor, 4 receptionist

pub fn ensure_staff(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == 0 {
        Err(ApiError::Forbidden("FORBIDDEN", "staff only".into()))
    } else {
        Ok(())
    }
}

pub fn ensure_admin_or_manager(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == 1 || auth.role == 2 {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "FORBIDDEN",
            format!("admin/manager only (signed in as {})", auth.role_name()),
        ))
    }
}
