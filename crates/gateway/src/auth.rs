//! Shared-key authentication.
//!
//! One bearer key, compared via SHA-256 digests so the comparison cost does
//! not depend on where the strings diverge. Anonymous mode (dev only) maps
//! an `X-Bay-Owner` header to the owner instead.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bay_common::BayError;
use sha2::{Digest as _, Sha256};

use crate::error::ApiError;
use crate::state::AppState;

/// Owner identity every authenticated handler sees.
#[derive(Debug, Clone)]
pub struct Identity {
    pub owner: String,
}

/// The single owner value used when authentication is key-based.
const DEFAULT_OWNER: &str = "default";
const OWNER_HEADER: &str = "x-bay-owner";

fn digests_match(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let security = &state.config.security;

    let identity = if let Some(token) = bearer_token(&request) {
        if !security.api_key.is_empty() && digests_match(token, &security.api_key) {
            Some(Identity {
                owner: DEFAULT_OWNER.to_string(),
            })
        } else {
            None
        }
    } else if security.allow_anonymous {
        let owner = request
            .headers()
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .unwrap_or("anonymous")
            .to_string();
        Some(Identity { owner })
    } else {
        None
    };

    match identity {
        Some(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        None => ApiError(BayError::unauthorized("missing or invalid API key")).into_response(),
    }
}
