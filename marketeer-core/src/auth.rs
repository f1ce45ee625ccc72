//! OAuth provider registry and user-auth tokens.
//!
//! Providers are registered into a map at boot from environment-configured
//! client credentials; nothing is hard-coded by name in conditionals. The
//! token endpoints speak `grant_type=authorization_code` and
//! `grant_type=refresh_token`; when a provider omits a new refresh token on
//! refresh, the old one is preserved. User-facing session tokens are
//! HS-family JWTs.

use crate::error::{AuthError, ConfigError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// OAuth providers
// ---------------------------------------------------------------------------

/// Configuration for one OAuth 2.0 provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    pub provider: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub user_info_uri: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
}

impl OAuthProviderConfig {
    /// Build the authorization URL for the standard code flow.
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        state: Option<&str>,
        scope_override: Option<&[String]>,
    ) -> String {
        let scopes = scope_override.unwrap_or(&self.scopes).join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}",
            self.auth_uri,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
        );
        if let Some(state) = state {
            url.push_str("&state=");
            url.push_str(&urlencoding::encode(state));
        }
        url
    }
}

/// The built-in provider endpoints; client credentials come from
/// `<PROVIDER>_CLIENT_ID` / `<PROVIDER>_CLIENT_SECRET`.
pub fn provider_registry_from_env() -> HashMap<String, OAuthProviderConfig> {
    let seeds = [
        (
            "google",
            "https://accounts.google.com/o/oauth2/auth",
            "https://oauth2.googleapis.com/token",
            "https://www.googleapis.com/oauth2/v3/userinfo",
            vec![
                "https://www.googleapis.com/auth/userinfo.profile",
                "https://www.googleapis.com/auth/userinfo.email",
            ],
        ),
        (
            "facebook",
            "https://www.facebook.com/v18.0/dialog/oauth",
            "https://graph.facebook.com/v18.0/oauth/access_token",
            "https://graph.facebook.com/v18.0/me?fields=id,name,email,picture",
            vec![
                "email",
                "public_profile",
                "pages_manage_posts",
                "pages_read_engagement",
                "instagram_basic",
                "instagram_content_publish",
            ],
        ),
        (
            "linkedin",
            "https://www.linkedin.com/oauth/v2/authorization",
            "https://www.linkedin.com/oauth/v2/accessToken",
            "https://api.linkedin.com/v2/me",
            vec!["r_liteprofile", "r_emailaddress", "w_member_social"],
        ),
    ];

    let mut registry = HashMap::new();
    for (name, auth_uri, token_uri, user_info_uri, scopes) in seeds {
        let upper = name.to_ascii_uppercase();
        let client_id = std::env::var(format!("{upper}_CLIENT_ID")).unwrap_or_default();
        let client_secret = std::env::var(format!("{upper}_CLIENT_SECRET")).unwrap_or_default();
        registry.insert(
            name.to_string(),
            OAuthProviderConfig {
                provider: name.to_string(),
                auth_uri: auth_uri.to_string(),
                token_uri: token_uri.to_string(),
                user_info_uri: user_info_uri.to_string(),
                client_id,
                client_secret,
                scopes: scopes.into_iter().map(String::from).collect(),
            },
        );
    }
    registry
}

/// Token material returned by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: String,
}

/// Trait seam for provider token endpoints; tests substitute a mock.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// POST a form to `token_uri` and return the parsed JSON body.
    async fn post_form(
        &self,
        token_uri: &str,
        form: &[(String, String)],
    ) -> Result<serde_json::Value, String>;

    /// GET the provider's user-info endpoint with a bearer token.
    async fn get_user_info(
        &self,
        user_info_uri: &str,
        access_token: &str,
    ) -> Result<serde_json::Value, String>;
}

/// Real token endpoint over reqwest.
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
}

impl HttpTokenEndpoint {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTokenEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn post_form(
        &self,
        token_uri: &str,
        form: &[(String, String)],
    ) -> Result<serde_json::Value, String> {
        let response = self
            .client
            .post(token_uri)
            .form(form)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("token endpoint returned {status}: {body}"));
        }
        Ok(body)
    }

    async fn get_user_info(
        &self,
        user_info_uri: &str,
        access_token: &str,
    ) -> Result<serde_json::Value, String> {
        let response = self
            .client
            .get(user_info_uri)
            .bearer_auth(access_token)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("user info endpoint returned {status}"));
        }
        Ok(body)
    }
}

/// OAuth client over a provider registry.
pub struct OAuthClient {
    providers: HashMap<String, OAuthProviderConfig>,
    endpoint: std::sync::Arc<dyn TokenEndpoint>,
}

impl OAuthClient {
    pub fn new(
        providers: HashMap<String, OAuthProviderConfig>,
        endpoint: std::sync::Arc<dyn TokenEndpoint>,
    ) -> Self {
        Self {
            providers,
            endpoint,
        }
    }

    pub fn provider(&self, name: &str) -> Result<&OAuthProviderConfig, AuthError> {
        self.providers
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| AuthError::UnknownProvider {
                provider: name.to_string(),
            })
    }

    fn parse_token(provider: &str, body: &serde_json::Value) -> Result<OAuthToken, AuthError> {
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::ExchangeFailed {
                provider: provider.to_string(),
                message: "response missing access_token".into(),
            })?
            .to_string();
        let expires_at = body
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .map(|secs| Utc::now() + Duration::seconds(secs));
        Ok(OAuthToken {
            access_token,
            refresh_token: body
                .get("refresh_token")
                .and_then(|v| v.as_str())
                .map(String::from),
            expires_at,
            token_type: body
                .get("token_type")
                .and_then(|v| v.as_str())
                .unwrap_or("Bearer")
                .to_string(),
        })
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        provider: &str,
        auth_code: &str,
        redirect_uri: &str,
    ) -> Result<OAuthToken, AuthError> {
        let config = self.provider(provider)?;
        let form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), auth_code.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("client_id".to_string(), config.client_id.clone()),
            ("client_secret".to_string(), config.client_secret.clone()),
        ];
        let body = self
            .endpoint
            .post_form(&config.token_uri, &form)
            .await
            .map_err(|message| AuthError::ExchangeFailed {
                provider: provider.to_string(),
                message,
            })?;
        Self::parse_token(provider, &body)
    }

    /// Run the refresh exchange. If the provider omits a new refresh token,
    /// the old one is preserved on the returned token.
    pub async fn refresh(
        &self,
        provider: &str,
        refresh_token: &str,
    ) -> Result<OAuthToken, AuthError> {
        let config = self.provider(provider)?;
        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
            ("client_id".to_string(), config.client_id.clone()),
            ("client_secret".to_string(), config.client_secret.clone()),
        ];
        let body = self
            .endpoint
            .post_form(&config.token_uri, &form)
            .await
            .map_err(|message| AuthError::RefreshFailed {
                provider: provider.to_string(),
                message,
            })?;
        let mut token = Self::parse_token(provider, &body)?;
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    /// Fetch the provider's user-info document for an access token.
    pub async fn user_info(
        &self,
        provider: &str,
        access_token: &str,
    ) -> Result<serde_json::Value, AuthError> {
        let config = self.provider(provider)?;
        self.endpoint
            .get_user_info(&config.user_info_uri, access_token)
            .await
            .map_err(|message| AuthError::ExchangeFailed {
                provider: provider.to_string(),
                message,
            })
    }
}

// ---------------------------------------------------------------------------
// Session tokens (JWT)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject: the user id.
    pub sub: String,
    /// OAuth provider that authenticated the user.
    pub provider: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies HS-family session tokens.
pub struct SessionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    expiry: Duration,
}

impl SessionTokens {
    pub fn new(secret: &str, algorithm: &str, expiry_secs: i64) -> Result<Self, ConfigError> {
        let algorithm = match algorithm.to_ascii_uppercase().as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => {
                return Err(ConfigError::UnsupportedJwtAlgorithm {
                    algorithm: other.to_string(),
                });
            }
        };
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            expiry: Duration::seconds(expiry_secs),
        })
    }

    pub fn issue(&self, user_id: &str, provider: &str) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: user_id.to_string(),
            provider: provider.to_string(),
            iat: now.timestamp(),
            exp: (now + self.expiry).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, AuthError> {
        let validation = Validation::new(self.algorithm);
        jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    struct MockEndpoint {
        token_body: serde_json::Value,
    }

    #[async_trait]
    impl TokenEndpoint for MockEndpoint {
        async fn post_form(
            &self,
            _token_uri: &str,
            _form: &[(String, String)],
        ) -> Result<serde_json::Value, String> {
            Ok(self.token_body.clone())
        }

        async fn get_user_info(
            &self,
            _user_info_uri: &str,
            _access_token: &str,
        ) -> Result<serde_json::Value, String> {
            Ok(json!({"id": "u-1", "name": "Test User"}))
        }
    }

    fn client_with(body: serde_json::Value) -> OAuthClient {
        let mut providers = HashMap::new();
        providers.insert(
            "linkedin".to_string(),
            OAuthProviderConfig {
                provider: "linkedin".into(),
                auth_uri: "https://www.linkedin.com/oauth/v2/authorization".into(),
                token_uri: "https://www.linkedin.com/oauth/v2/accessToken".into(),
                user_info_uri: "https://api.linkedin.com/v2/me".into(),
                client_id: "cid".into(),
                client_secret: "cs".into(),
                scopes: vec!["w_member_social".into()],
            },
        );
        OAuthClient::new(providers, Arc::new(MockEndpoint { token_body: body }))
    }

    #[test]
    fn test_authorization_url_includes_state_and_scopes() {
        let client = client_with(json!({}));
        let config = client.provider("linkedin").unwrap();
        let url = config.authorization_url("https://app.example/cb", Some("xyz"), None);
        assert!(url.starts_with("https://www.linkedin.com/oauth/v2/authorization?"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("state=xyz"));
        assert!(url.contains("w_member_social"));
        assert!(url.contains(&urlencoding::encode("https://app.example/cb").into_owned()));
    }

    #[tokio::test]
    async fn test_exchange_code_parses_token() {
        let client = client_with(json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_in": 3600,
            "token_type": "Bearer",
        }));
        let token = client
            .exchange_code("linkedin", "code", "https://app.example/cb")
            .await
            .unwrap();
        assert_eq!(token.access_token, "at-1");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
        assert!(token.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_refresh_preserves_old_refresh_token() {
        // Provider omits refresh_token in the refresh response.
        let client = client_with(json!({
            "access_token": "at-2",
            "expires_in": 1800,
        }));
        let token = client.refresh("linkedin", "rt-old").await.unwrap();
        assert_eq!(token.access_token, "at-2");
        assert_eq!(token.refresh_token.as_deref(), Some("rt-old"));
    }

    #[tokio::test]
    async fn test_unknown_provider_rejected() {
        let client = client_with(json!({}));
        let result = client.exchange_code("myspace", "c", "r").await;
        assert!(matches!(result, Err(AuthError::UnknownProvider { .. })));
    }

    #[tokio::test]
    async fn test_exchange_missing_access_token_fails() {
        let client = client_with(json!({"error": "invalid_grant"}));
        let result = client.exchange_code("linkedin", "bad", "r").await;
        assert!(matches!(result, Err(AuthError::ExchangeFailed { .. })));
    }

    #[test]
    fn test_provider_registry_seeds_three_providers() {
        let registry = provider_registry_from_env();
        assert!(registry.contains_key("google"));
        assert!(registry.contains_key("facebook"));
        assert!(registry.contains_key("linkedin"));
        assert!(
            registry["google"]
                .scopes
                .iter()
                .any(|s| s.contains("userinfo.email"))
        );
    }

    #[test]
    fn test_session_token_roundtrip() {
        let tokens = SessionTokens::new("test-secret", "HS256", 3600).unwrap();
        let jwt = tokens.issue("u-1", "google").unwrap();
        let claims = tokens.verify(&jwt).unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.provider, "google");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_session_token_wrong_secret_rejected() {
        let issuer = SessionTokens::new("secret-a", "HS256", 3600).unwrap();
        let verifier = SessionTokens::new("secret-b", "HS256", 3600).unwrap();
        let jwt = issuer.issue("u-1", "google").unwrap();
        assert!(verifier.verify(&jwt).is_err());
    }

    #[test]
    fn test_unsupported_algorithm_rejected() {
        let result = SessionTokens::new("s", "RS256", 3600);
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedJwtAlgorithm { .. })
        ));
    }
}
