//! JWT 凭证校验
//!
//! 凭证由外部账号服务签发，这里只负责校验签名、过期时间和签发方。

use application::{IdentityVerifier, VerifyError};
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use config::AuthConfig;
use domain::{Identity, UserId};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// 用户 id
    pub sub: Uuid,
    pub exp: i64, // 过期时间 (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[derive(Clone)]
pub struct JwtIdentityVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
            validation.set_required_spec_claims(&["exp", "iss"]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, VerifyError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(VerifyError::Missing);
        }

        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| Identity::new(UserId::from(data.claims.sub)))
            .map_err(|err| VerifyError::Invalid(err.to_string()))
    }
}

/// 从 `Authorization: Bearer <token>` 头里取出凭证
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
