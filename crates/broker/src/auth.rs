use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::debug;

use crate::config::AuthConfig;

/// Bearer-token verifier: HS256 signature plus a boolean claim at a
/// configured JSON path.
pub struct AuthGuard {
    key: DecodingKey,
    validation: Validation,
    role_path: Vec<String>,
}

impl AuthGuard {
    /// Build a guard from the middleware config.
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            key: DecodingKey::from_secret(config.secret().as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            role_path: config.role_path.clone(),
        }
    }

    /// Verify `token` (with or without a `Bearer ` prefix). With an empty
    /// role path a valid signature alone is enough.
    pub fn check(&self, token: &str) -> bool {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        let claims = match jsonwebtoken::decode::<Value>(token, &self.key, &self.validation) {
            Ok(data) => data.claims,
            Err(err) => {
                debug!(error = %err, "rejecting bearer token");
                return false;
            }
        };
        self.role_path.is_empty() || bool_at_path(&claims, &self.role_path)
    }
}

/// Walk `path` into `claims`; true only if a boolean `true` sits at the end.
fn bool_at_path(claims: &Value, path: &[String]) -> bool {
    let mut value = claims;
    for key in path {
        match value.get(key) {
            Some(next) => value = next,
            None => return false,
        }
    }
    value.as_bool().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    use super::*;

    // Some time in 2100, so test tokens never expire.
    const FAR_FUTURE: u64 = 4_102_444_800;

    fn guard(secret: &str, role_path: &[&str]) -> AuthGuard {
        AuthGuard::new(&AuthConfig {
            jwt_secret_key: secret.to_string(),
            jwt_secret_key_env: String::new(),
            role_path: role_path.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn token(secret: &str, claims: &Value) -> String {
        jsonwebtoken::encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn bool_at_path_walks_nested_claims() {
        let claims = json!({ "role": { "llm": true }, "other": { "llm": false } });
        assert!(bool_at_path(
            &claims,
            &["role".to_string(), "llm".to_string()]
        ));
        assert!(!bool_at_path(
            &claims,
            &["other".to_string(), "llm".to_string()]
        ));
        assert!(!bool_at_path(&claims, &["missing".to_string()]));
    }

    #[test]
    fn accepts_a_signed_token_with_the_role_claim() {
        let guard = guard("s3cret", &["role", "llm"]);
        let token = token("s3cret", &json!({ "role": { "llm": true }, "exp": FAR_FUTURE }));
        assert!(guard.check(&token));
        assert!(guard.check(&format!("Bearer {token}")));
    }

    #[test]
    fn rejects_a_token_signed_with_another_secret() {
        let guard = guard("s3cret", &[]);
        let token = token("wrong", &json!({ "exp": FAR_FUTURE }));
        assert!(!guard.check(&token));
    }

    #[test]
    fn rejects_a_token_missing_the_role_claim() {
        let guard = guard("s3cret", &["role", "llm"]);
        let token = token("s3cret", &json!({ "role": {}, "exp": FAR_FUTURE }));
        assert!(!guard.check(&token));
    }

    #[test]
    fn rejects_garbage() {
        let guard = guard("s3cret", &[]);
        assert!(!guard.check(""));
        assert!(!guard.check("not-a-jwt"));
    }
}
