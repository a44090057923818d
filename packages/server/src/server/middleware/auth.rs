//! Worker authentication.
//!
//! Bearer JWTs are validated against a JWKS document (cached, refetched on
//! an unknown `kid`) with required issuer and audience. Development
//! deployments may instead configure an HS256 shared secret. The tenant is
//! the `tenant` claim; the `admin` claim gates the admin routes.

use std::collections::HashMap;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::common::{QueueError, QueueResult};
use crate::config::Config;
use crate::server::app::AppState;

/// Authenticated caller attached to request extensions.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub subject: String,
    pub tenant_id: String,
    pub is_admin: bool,
}

impl AuthContext {
    pub fn require_admin(&self) -> QueueResult<()> {
        if self.is_admin {
            Ok(())
        } else {
            Err(QueueError::Forbidden("admin access required".to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    admin: Option<bool>,
}

enum KeySource {
    Jwks {
        url: String,
        http: reqwest::Client,
        keys: RwLock<HashMap<String, DecodingKey>>,
    },
    DevSecret(DecodingKey),
}

pub struct WorkerAuth {
    source: KeySource,
    issuer: Option<String>,
    audience: Option<String>,
}

impl WorkerAuth {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let source = match (&config.worker_jwks_url, &config.dev_auth_secret) {
            (Some(url), _) => KeySource::Jwks {
                url: url.clone(),
                http: reqwest::Client::new(),
                keys: RwLock::new(HashMap::new()),
            },
            (None, Some(secret)) => {
                KeySource::DevSecret(DecodingKey::from_secret(secret.as_bytes()))
            }
            (None, None) => anyhow::bail!("no worker auth source configured"),
        };
        Ok(Self {
            source,
            issuer: config.worker_issuer.clone(),
            audience: config.worker_audience.clone(),
        })
    }

    pub async fn authenticate(&self, token: &str) -> QueueResult<AuthContext> {
        let header = decode_header(token).map_err(|_| QueueError::Unauthenticated)?;

        let (key, algorithm) = match &self.source {
            KeySource::DevSecret(key) => {
                if header.alg != Algorithm::HS256 {
                    return Err(QueueError::Unauthenticated);
                }
                (key.clone(), Algorithm::HS256)
            }
            KeySource::Jwks { .. } => {
                // Symmetric algorithms are never acceptable against a JWKS.
                if matches!(
                    header.alg,
                    Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
                ) {
                    return Err(QueueError::Unauthenticated);
                }
                let kid = header.kid.as_deref().ok_or(QueueError::Unauthenticated)?;
                (self.jwks_key(kid).await?, header.alg)
            }
        };

        let mut validation = Validation::new(algorithm);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        let data =
            decode::<Claims>(token, &key, &validation).map_err(|_| QueueError::Unauthenticated)?;

        Ok(AuthContext {
            subject: data.claims.sub,
            tenant_id: data.claims.tenant.unwrap_or_default(),
            is_admin: data.claims.admin.unwrap_or(false),
        })
    }

    async fn jwks_key(&self, kid: &str) -> QueueResult<DecodingKey> {
        let KeySource::Jwks { url, http, keys } = &self.source else {
            return Err(QueueError::Unauthenticated);
        };

        if let Some(key) = keys.read().await.get(kid) {
            return Ok(key.clone());
        }

        // Unknown kid: refetch the document once, then give up.
        debug!(kid, "refreshing JWKS");
        let jwks: JwkSet = http
            .get(url)
            .send()
            .await
            .map_err(|e| QueueError::Internal(anyhow::anyhow!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| QueueError::Internal(anyhow::anyhow!("JWKS parse failed: {e}")))?;

        let mut cache = keys.write().await;
        for jwk in &jwks.keys {
            if let (Some(id), Ok(key)) = (&jwk.common.key_id, DecodingKey::from_jwk(jwk)) {
                cache.insert(id.clone(), key);
            }
        }
        cache
            .get(kid)
            .cloned()
            .ok_or(QueueError::Unauthenticated)
    }
}

/// Require a valid bearer token and attach [`AuthContext`].
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match bearer_token(&request) {
        Some(token) => token,
        None => return QueueError::Unauthenticated.into_response(),
    };

    match state.auth.authenticate(&token).await {
        Ok(context) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Err(error) => error.into_response(),
    }
}

fn bearer_token(request: &Request) -> Option<String> {
    let header = request.headers().get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ").unwrap_or(header);
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn auth_with_secret(secret: &str) -> WorkerAuth {
        let config = Config {
            dev_auth_secret: Some(secret.to_string()),
            worker_issuer: Some("codeq-test".to_string()),
            ..Config::default()
        };
        WorkerAuth::from_config(&config).unwrap()
    }

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(tenant: Option<&str>, admin: bool) -> serde_json::Value {
        json!({
            "sub": "worker-1",
            "tenant": tenant,
            "admin": admin,
            "iss": "codeq-test",
            "exp": chrono::Utc::now().timestamp() + 600,
        })
    }

    #[tokio::test]
    async fn accepts_valid_dev_token() {
        let auth = auth_with_secret("s3cret");
        let context = auth
            .authenticate(&token("s3cret", claims(Some("acme"), false)))
            .await
            .unwrap();
        assert_eq!(context.subject, "worker-1");
        assert_eq!(context.tenant_id, "acme");
        assert!(!context.is_admin);
    }

    #[tokio::test]
    async fn missing_tenant_claim_maps_to_default_tenant() {
        let auth = auth_with_secret("s3cret");
        let context = auth
            .authenticate(&token("s3cret", claims(None, true)))
            .await
            .unwrap();
        assert_eq!(context.tenant_id, "");
        assert!(context.is_admin);
    }

    #[tokio::test]
    async fn rejects_wrong_secret() {
        let auth = auth_with_secret("s3cret");
        let result = auth
            .authenticate(&token("other", claims(Some("acme"), false)))
            .await;
        assert!(matches!(result, Err(QueueError::Unauthenticated)));
    }

    #[tokio::test]
    async fn rejects_wrong_issuer() {
        let auth = auth_with_secret("s3cret");
        let bad = json!({
            "sub": "worker-1",
            "iss": "someone-else",
            "exp": chrono::Utc::now().timestamp() + 600,
        });
        let result = auth.authenticate(&token("s3cret", bad)).await;
        assert!(matches!(result, Err(QueueError::Unauthenticated)));
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let auth = auth_with_secret("s3cret");
        assert!(auth.authenticate("not-a-jwt").await.is_err());
    }

    #[test]
    fn admin_gate() {
        let worker = AuthContext {
            subject: "w".to_string(),
            tenant_id: String::new(),
            is_admin: false,
        };
        assert!(worker.require_admin().is_err());

        let admin = AuthContext {
            is_admin: true,
            ..worker
        };
        assert!(admin.require_admin().is_ok());
    }
}
