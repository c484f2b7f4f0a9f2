//! Scope-enforcing middleware. Validates the bearer token, inserts the
//! resulting AuthContext into request extensions, and rejects on missing
//! scope with the standard error envelope.

use super::{AuthContext, AuthFailure, Scope};
use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};

async fn require_scope(
    state: AppState,
    scope: Scope,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let ctx: AuthContext = state
        .auth
        .authenticate(header)
        .await
        .map_err(|failure| match failure {
            AuthFailure::MissingToken | AuthFailure::InvalidToken => {
                ApiError::unauthenticated(failure.message())
            }
        })?;

    if !ctx.has_scope(scope) {
        return Err(ApiError::forbidden(format!(
            "Scope {} required",
            scope.as_str()
        )));
    }

    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}

pub async fn require_submit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    require_scope(state, Scope::Submit, req, next).await
}

pub async fn require_read(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    require_scope(state, Scope::Read, req, next).await
}

pub async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    require_scope(state, Scope::Admin, req, next).await
}
