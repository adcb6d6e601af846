//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs carrying `sub` (user id) and `org_id` (tenant).
//! Protected routes run behind [`require_auth`], which verifies the token
//! and injects an [`AuthContext`] into request extensions; requests without
//! a valid token are rejected with 401 before reaching a handler.

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::server::error::ApiError;

/// Authenticated request identity.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: String,
    pub org_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    org_id: Uuid,
    exp: i64,
}

/// HS256 token verification (and minting, for tests and dev tooling).
pub struct JwtVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthContext, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| ApiError::Unauthorized(format!("invalid token: {e}")))?;

        Ok(AuthContext {
            user_id: data.claims.sub,
            org_id: data.claims.org_id,
        })
    }

    /// Mint a token valid for one hour.
    pub fn issue(&self, user_id: &str, org_id: Uuid) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            org_id,
            exp: chrono::Utc::now().timestamp() + 3600,
        };
        encode(&Header::default(), &claims, &self.encoding).expect("token encodes")
    }
}

/// Middleware guarding the job and vector routes.
pub async fn require_auth(
    axum::extract::State(verifier): axum::extract::State<std::sync::Arc<JwtVerifier>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = match bearer_token(&request) {
        Some(token) => token,
        None => {
            return ApiError::Unauthorized("missing bearer token".to_string()).into_response();
        }
    };

    match verifier.verify(token) {
        Ok(ctx) => {
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

fn bearer_token(request: &Request<Body>) -> Option<&str> {
    let header = request.headers().get("authorization")?.to_str().ok()?;
    header.strip_prefix("Bearer ").or(Some(header))
}
