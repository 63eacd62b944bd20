//! Bearer tokens for the tag-manager and warehouse APIs.
//!
//! The exporter never stores credentials itself. A [`TokenProvider`] hands
//! out access tokens, refreshing them shortly before they expire.
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Read access to tag-manager configuration plus streaming inserts.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/tagmanager.readonly",
    "https://www.googleapis.com/auth/bigquery.insertdata",
];

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;
// Tokens are refreshed this long before the expiry the server reported.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("could not read credentials file {path}: {source}")]
    ReadCredentials {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid credentials file {path}: {source}")]
    ParseCredentials {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("could not sign token assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("system clock is before the unix epoch")]
    Clock,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;

    /// Project the credentials belong to, when the credentials say so.
    fn project_id(&self) -> Option<&str> {
        None
    }
}

/// A fixed token. Used for fixture runs and tests.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

/// Picks a provider: the credentials file when one is configured, the
/// metadata server otherwise.
pub fn provider_for(
    credentials_file: Option<&Path>,
    client: reqwest::Client,
) -> Result<Arc<dyn TokenProvider>, AuthError> {
    match credentials_file {
        Some(path) => from_credentials_file(path, client),
        None => Ok(Arc::new(MetadataServer::new(client, METADATA_TOKEN_URL))),
    }
}

pub fn from_credentials_file(
    path: &Path,
    client: reqwest::Client,
) -> Result<Arc<dyn TokenProvider>, AuthError> {
    let data = std::fs::read(path).map_err(|source| AuthError::ReadCredentials {
        path: path.to_path_buf(),
        source,
    })?;
    let credentials: CredentialsFile =
        serde_json::from_slice(&data).map_err(|source| AuthError::ParseCredentials {
            path: path.to_path_buf(),
            source,
        })?;

    let provider: Arc<dyn TokenProvider> = match credentials {
        CredentialsFile::ServiceAccount(key) => Arc::new(ServiceAccount::new(key, client)?),
        CredentialsFile::AuthorizedUser(user) => Arc::new(AuthorizedUser::new(user, client)),
    };

    Ok(provider)
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUserKey),
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
    project_id: Option<String>,
}

#[derive(Deserialize)]
struct AuthorizedUserKey {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
    quota_project_id: Option<String>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Holds the current token. The lock is held across a refresh so concurrent
/// callers wait for one token request instead of issuing their own.
#[derive(Default)]
struct TokenCache(Mutex<Option<CachedToken>>);

impl TokenCache {
    async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenResponse, AuthError>>,
    {
        let mut cached = self.0.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.token.clone());
        }

        let response = fetch().await?;
        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            token: response.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        tracing::debug!(expires_in = response.expires_in, "Fetched access token");

        Ok(response.access_token)
    }
}

async fn read_token_response(response: reqwest::Response) -> Result<TokenResponse, AuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::Rejected { status, body });
    }
    Ok(response.json::<TokenResponse>().await?)
}

/// Signs a JWT with the service account key and trades it for an access token.
pub struct ServiceAccount {
    client: reqwest::Client,
    client_email: String,
    token_uri: String,
    project_id: Option<String>,
    key: EncodingKey,
    cache: TokenCache,
}

impl ServiceAccount {
    fn new(key: ServiceAccountKey, client: reqwest::Client) -> Result<Self, AuthError> {
        Ok(ServiceAccount {
            client,
            key: EncodingKey::from_rsa_pem(key.private_key.as_bytes())?,
            client_email: key.client_email,
            token_uri: key.token_uri,
            project_id: key.project_id,
            cache: TokenCache::default(),
        })
    }

    fn assertion(&self) -> Result<String, AuthError> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| AuthError::Clock)?
            .as_secs();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: SCOPES.join(" "),
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.key,
        )?)
    }
}

#[async_trait]
impl TokenProvider for ServiceAccount {
    async fn access_token(&self) -> Result<String, AuthError> {
        self.cache
            .get_or_fetch(|| async {
                let assertion = self.assertion()?;
                let response = self
                    .client
                    .post(&self.token_uri)
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
                    .send()
                    .await?;
                read_token_response(response).await
            })
            .await
    }

    fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }
}

/// User credentials from `gcloud auth application-default login`.
pub struct AuthorizedUser {
    client: reqwest::Client,
    key: AuthorizedUserKey,
    cache: TokenCache,
}

impl AuthorizedUser {
    fn new(key: AuthorizedUserKey, client: reqwest::Client) -> Self {
        AuthorizedUser {
            client,
            key,
            cache: TokenCache::default(),
        }
    }
}

#[async_trait]
impl TokenProvider for AuthorizedUser {
    async fn access_token(&self) -> Result<String, AuthError> {
        self.cache
            .get_or_fetch(|| async {
                let response = self
                    .client
                    .post(&self.key.token_uri)
                    .form(&[
                        ("grant_type", "refresh_token"),
                        ("client_id", self.key.client_id.as_str()),
                        ("client_secret", self.key.client_secret.as_str()),
                        ("refresh_token", self.key.refresh_token.as_str()),
                    ])
                    .send()
                    .await?;
                read_token_response(response).await
            })
            .await
    }

    fn project_id(&self) -> Option<&str> {
        self.key.quota_project_id.as_deref()
    }
}

/// Default service account of the compute instance the exporter runs on.
pub struct MetadataServer {
    client: reqwest::Client,
    url: String,
    cache: TokenCache,
}

impl MetadataServer {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        MetadataServer {
            client,
            url: url.into(),
            cache: TokenCache::default(),
        }
    }
}

#[async_trait]
impl TokenProvider for MetadataServer {
    async fn access_token(&self) -> Result<String, AuthError> {
        self.cache
            .get_or_fetch(|| async {
                let response = self
                    .client
                    .get(&self.url)
                    .header("Metadata-Flavor", "Google")
                    .query(&[("scopes", SCOPES.join(","))])
                    .send()
                    .await?;
                read_token_response(response).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = include_str!("../tests/data/test_service_account_key.pem");

    fn write_credentials(value: serde_json::Value) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, "{value}").unwrap();
        tmp
    }

    fn token_body(token: &str) -> serde_json::Value {
        serde_json::json!({"access_token": token, "expires_in": 3599, "token_type": "Bearer"})
    }

    #[tokio::test]
    async fn test_service_account_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
            .and(body_string_contains("assertion="))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("sa-token")))
            // The second call is served from the cache
            .expect(1)
            .mount(&mock_server)
            .await;

        let credentials = write_credentials(serde_json::json!({
            "type": "service_account",
            "project_id": "analytics",
            "client_email": "exporter@analytics.iam.gserviceaccount.com",
            "private_key": TEST_KEY,
            "token_uri": format!("{}/token", mock_server.uri()),
        }));

        let provider = from_credentials_file(credentials.path(), reqwest::Client::new()).unwrap();
        assert_eq!(provider.project_id(), Some("analytics"));
        assert_eq!(provider.access_token().await.unwrap(), "sa-token");
        assert_eq!(provider.access_token().await.unwrap(), "sa-token");
    }

    #[tokio::test]
    async fn test_authorized_user_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("user-token")))
            .mount(&mock_server)
            .await;

        let credentials = write_credentials(serde_json::json!({
            "type": "authorized_user",
            "client_id": "id",
            "client_secret": "secret",
            "refresh_token": "rt",
            "token_uri": format!("{}/token", mock_server.uri()),
        }));

        let provider = from_credentials_file(credentials.path(), reqwest::Client::new()).unwrap();
        assert_eq!(provider.access_token().await.unwrap(), "user-token");
    }

    #[tokio::test]
    async fn test_metadata_server_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("vm-token")))
            .mount(&mock_server)
            .await;

        let provider = MetadataServer::new(
            reqwest::Client::new(),
            format!("{}/token", mock_server.uri()),
        );
        assert_eq!(provider.access_token().await.unwrap(), "vm-token");
    }

    #[tokio::test]
    async fn test_rejected_token_request() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&mock_server)
            .await;

        let credentials = write_credentials(serde_json::json!({
            "type": "authorized_user",
            "client_id": "id",
            "client_secret": "secret",
            "refresh_token": "revoked",
            "token_uri": format!("{}/token", mock_server.uri()),
        }));

        let provider = from_credentials_file(credentials.path(), reqwest::Client::new()).unwrap();
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { body, .. } if body == "invalid_grant"));
    }

    #[test]
    fn test_bad_credentials_files() {
        let missing = from_credentials_file(Path::new("/nonexistent/key.json"), reqwest::Client::new());
        assert!(matches!(missing, Err(AuthError::ReadCredentials { .. })));

        let unknown = write_credentials(serde_json::json!({"type": "external_account"}));
        let result = from_credentials_file(unknown.path(), reqwest::Client::new());
        assert!(matches!(result, Err(AuthError::ParseCredentials { .. })));

        let bad_key = write_credentials(serde_json::json!({
            "type": "service_account",
            "client_email": "a@b",
            "private_key": "not a key",
        }));
        let result = from_credentials_file(bad_key.path(), reqwest::Client::new());
        assert!(matches!(result, Err(AuthError::Signing(_))));
    }
}
