use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::{
    AuthType, AuthUrl, ClientId, ClientSecret, HttpRequest, HttpResponse, RequestTokenError,
    ResourceOwnerPassword, ResourceOwnerUsername, TokenResponse, TokenUrl,
};
use reddimon_core::{ConfigError, CoreError, RedditApiError, RedditSettings};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const AUTH_URL: &str = "https://www.reddit.com/api/v1/authorize";
pub const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";

/// Tokens are refreshed this long before Reddit would reject them.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Script-app credentials for the OAuth2 password grant.
#[derive(Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
}

impl RedditCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let credentials = Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            username: username.into(),
            password: password.into(),
            user_agent: user_agent.into(),
        };

        for (field, value) in [
            ("reddit.client_id", &credentials.client_id),
            ("reddit.client_secret", &credentials.client_secret),
            ("reddit.username", &credentials.username),
            ("reddit.password", &credentials.password),
            ("reddit.user_agent", &credentials.user_agent),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: field.to_string(),
                }
                .into());
            }
        }

        Ok(credentials)
    }

    pub fn from_settings(settings: &RedditSettings, user_agent: &str) -> Result<Self, CoreError> {
        let field = |value: &Option<String>| value.clone().unwrap_or_default();
        Self::new(
            field(&settings.client_id),
            field(&settings.client_secret),
            field(&settings.username),
            field(&settings.password),
            user_agent,
        )
    }
}

impl fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_usable(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Holds one bearer token and refreshes it on demand.
pub struct Authenticator {
    oauth: BasicClient,
    http: reqwest::Client,
    username: ResourceOwnerUsername,
    password: ResourceOwnerPassword,
    token: Mutex<Option<CachedToken>>,
}

impl Authenticator {
    pub fn new(
        credentials: &RedditCredentials,
        http: reqwest::Client,
        token_url: &str,
    ) -> Result<Self, CoreError> {
        let auth_url = AuthUrl::new(AUTH_URL.to_string()).map_err(|e| invalid_url("auth_url", e))?;
        let token_url =
            TokenUrl::new(token_url.to_string()).map_err(|e| invalid_url("token_url", e))?;

        let oauth = BasicClient::new(
            ClientId::new(credentials.client_id.clone()),
            Some(ClientSecret::new(credentials.client_secret.clone())),
            auth_url,
            Some(token_url),
        )
        .set_auth_type(AuthType::BasicAuth);

        Ok(Self {
            oauth,
            http,
            username: ResourceOwnerUsername::new(credentials.username.clone()),
            password: ResourceOwnerPassword::new(credentials.password.clone()),
            token: Mutex::new(None),
        })
    }

    /// Current bearer token, fetching a new one when missing or close to expiry.
    pub async fn access_token(&self) -> Result<String, CoreError> {
        let mut token = self.token.lock().await;
        if let Some(cached) = token.as_ref().filter(|cached| cached.is_usable()) {
            return Ok(cached.access_token.clone());
        }

        debug!("Requesting new Reddit access token");
        let http = self.http.clone();
        let response = self
            .oauth
            .exchange_password(&self.username, &self.password)
            .request_async(move |request| send_token_request(http, request))
            .await
            .map_err(map_token_error)?;

        let lifetime = response.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME);
        let fresh = CachedToken {
            access_token: response.access_token().secret().clone(),
            expires_at: Instant::now() + lifetime,
        };
        info!("Obtained Reddit access token valid for {:?}", lifetime);

        let access_token = fresh.access_token.clone();
        *token = Some(fresh);
        Ok(access_token)
    }

    /// Forget the cached token after Reddit rejected it.
    pub async fn invalidate(&self) {
        warn!("Discarding rejected Reddit access token");
        *self.token.lock().await = None;
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("username", &self.username.as_str())
            .finish_non_exhaustive()
    }
}

fn invalid_url(field: &str, error: oauth2::url::ParseError) -> CoreError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: error.to_string(),
    }
    .into()
}

/// Sends an oauth2 token request through reqwest so the shared user agent
/// and timeouts apply.
async fn send_token_request(
    http: reqwest::Client,
    request: HttpRequest,
) -> Result<HttpResponse, reqwest::Error> {
    let response = http
        .request(request.method, request.url.as_str())
        .headers(request.headers)
        .body(request.body)
        .send()
        .await?;

    let status_code = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

fn map_token_error(error: RequestTokenError<reqwest::Error, BasicErrorResponse>) -> CoreError {
    match error {
        RequestTokenError::ServerResponse(response) => {
            CoreError::RedditApi(RedditApiError::AuthenticationFailed {
                reason: response.to_string(),
            })
        }
        RequestTokenError::Request(e) if e.is_timeout() => {
            CoreError::RedditApi(RedditApiError::RequestTimeout)
        }
        RequestTokenError::Request(e) => CoreError::Network(e),
        RequestTokenError::Parse(e, _) => {
            CoreError::RedditApi(RedditApiError::AuthenticationFailed {
                reason: format!("unexpected token response: {}", e),
            })
        }
        RequestTokenError::Other(reason) => {
            CoreError::RedditApi(RedditApiError::AuthenticationFailed { reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_require_every_field() {
        let result = RedditCredentials::new("id", "secret", "", "hunter2", "ua");
        match result {
            Err(CoreError::Config(ConfigError::MissingField { field })) => {
                assert_eq!(field, "reddit.username")
            }
            other => panic!("expected missing username, got {:?}", other),
        }
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let credentials =
            RedditCredentials::new("id", "s3cret", "bot", "hunter2", "web:reddimon:v1.0.0")
                .unwrap();
        let printed = format!("{:?}", credentials);
        assert!(printed.contains("bot"));
        assert!(!printed.contains("s3cret"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_credentials_from_settings() {
        let settings = RedditSettings {
            client_id: Some("id".to_string()),
            client_secret: Some("secret".to_string()),
            username: Some("bot".to_string()),
            password: None,
            user_agent: None,
        };
        assert!(RedditCredentials::from_settings(&settings, "ua").is_err());

        let settings = RedditSettings {
            password: Some("pw".to_string()),
            ..settings
        };
        let credentials = RedditCredentials::from_settings(&settings, "ua").unwrap();
        assert_eq!(credentials.user_agent, "ua");
    }

    #[test]
    fn test_cached_token_expiry_margin() {
        let nearly_expired = CachedToken {
            access_token: "t".to_string(),
            expires_at: Instant::now() + Duration::from_secs(30),
        };
        assert!(!nearly_expired.is_usable());

        let fresh = CachedToken {
            access_token: "t".to_string(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        };
        assert!(fresh.is_usable());
    }
}
