//! Installation token cache.
//!
//! Repository API requests are authenticated with a short-lived installation
//! token. To obtain one, an RS256-signed assertion is minted with the GitHub App
//! private key and exchanged over HTTPS. Tokens are cached in the local state
//! directory and reused until they are about to expire.

use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use common::config::Config;
use derive_more::{Display, Error, From};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, info, warn};

/// Name of the cached token file inside the local state directory.
pub(crate) const CREDENTIALS_FILE: &str = "credentials.json";

/// Cached tokens expiring sooner than this many seconds are not reused.
pub const EXPIRY_MARGIN: i64 = 60;

/// Lifespan of a signed assertion, in seconds.
const ASSERTION_LIFESPAN: i64 = 10 * 60;

/// Token lifespan assumed when the exchange response does not carry an expiry.
const DEFAULT_TOKEN_LIFESPAN: i64 = 60 * 60;

/// Media type expected by the installation token endpoint.
const ACCEPT_HEADER: &str = "application/vnd.github.machine-man-preview+json";

/// Credential cache errors.
#[derive(Debug, Display, From, Error)]
pub enum CredentialError {
    /// IO-related error.
    Io(io::Error),

    /// Unable to (de)serialize a token.
    Json(serde_json::Error),

    /// HTTP client error.
    Http(reqwest::Error),

    /// Unable to sign the exchange assertion.
    #[display(fmt = "unable to sign token exchange assertion: {}", _0)]
    Jwt(jsonwebtoken::errors::Error),

    /// Issuer identity is empty.
    #[display(fmt = "GitHub App identifier is not configured")]
    MissingIssuer,

    /// Signing key cannot be read.
    #[from(ignore)]
    #[display(fmt = "unable to read signing key {}: {}", path, source)]
    SigningKey { path: String, source: io::Error },

    /// Exchange endpoint rejected the assertion.
    #[from(ignore)]
    #[display(fmt = "token exchange failed with status {}", status)]
    Exchange { status: u16 },

    /// Exchange response carried an unparseable expiry timestamp.
    #[from(ignore)]
    #[display(fmt = "invalid token expiry timestamp {}", value)]
    InvalidExpiry { value: String },
}

/// Installation token together with its expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Bearer token value.
    #[serde(rename = "token")]
    value: String,

    /// Expiry timestamp, in seconds since the Unix epoch.
    expires_at: i64,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Token {
    /// Create a new token.
    pub fn new(value: String, expires_at: i64) -> Self {
        Self { value, expires_at }
    }

    /// Get bearer token value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Get expiry timestamp, in seconds since the Unix epoch.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Check if the token is still usable at `now`, accounting for [`EXPIRY_MARGIN`].
    pub fn is_fresh_at(&self, now: i64) -> bool {
        self.expires_at - EXPIRY_MARGIN > now
    }
}

/// Where a token returned by [`CredentialCache::token`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenSource {
    /// Previously persisted token was reused.
    Cached,

    /// Token was obtained by a new exchange.
    Fresh,
}

/// Exchange of a signed assertion for an installation token.
pub trait TokenExchange {
    /// Obtain a new installation token.
    fn exchange(&self) -> Result<Token, CredentialError>;
}

/// [`TokenExchange`] implementation for GitHub App installations.
pub struct InstallationTokenExchange {
    /// HTTP client.
    client: Client,

    /// Base URL of the API.
    api_url: String,

    /// Installation identifier.
    installation_id: u64,

    /// Assertion issuer.
    app_id: String,

    /// Path to the PEM-encoded RSA private key.
    private_key_path: PathBuf,
}

/// Claims of an exchange assertion.
#[derive(Serialize)]
struct AssertionClaims<'a> {
    /// Issued at.
    iat: i64,

    /// Expires at.
    exp: i64,

    /// Issuer.
    iss: &'a str,
}

/// JSON response body of the installation token endpoint.
#[derive(Deserialize)]
struct InstallationTokenResponse {
    /// Installation token.
    token: String,

    /// RFC 3339 expiry timestamp.
    #[serde(default)]
    expires_at: Option<String>,
}

impl InstallationTokenExchange {
    /// Create new exchange using the repository section of the configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            api_url: config.repository.api_url.trim_end_matches('/').to_owned(),
            installation_id: config.repository.installation_id,
            app_id: config.repository.app_id.clone(),
            private_key_path: config.repository.private_key_path.clone(),
        }
    }

    /// Mint an assertion signed with the configured private key.
    fn assertion(&self, now: i64) -> Result<String, CredentialError> {
        if self.app_id.is_empty() {
            return Err(CredentialError::MissingIssuer);
        }

        let pem = fs::read(&self.private_key_path).map_err(|source| {
            CredentialError::SigningKey {
                path: self.private_key_path.display().to_string(),
                source,
            }
        })?;

        let key = EncodingKey::from_rsa_pem(&pem)?;

        let claims = AssertionClaims {
            iat: now,
            exp: now + ASSERTION_LIFESPAN,
            iss: &self.app_id,
        };

        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &key,
        )?)
    }
}

impl TokenExchange for InstallationTokenExchange {
    fn exchange(&self) -> Result<Token, CredentialError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let assertion = self.assertion(now)?;

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, self.installation_id
        );

        debug!(%url, "requesting installation token");

        let response = self
            .client
            .post(url)
            .bearer_auth(assertion)
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .header(reqwest::header::USER_AGENT, "send-cli")
            .send()?;

        let status = response.status();

        if !status.is_success() {
            return Err(CredentialError::Exchange {
                status: status.as_u16(),
            });
        }

        let body: InstallationTokenResponse = response.json()?;

        let expires_at = match body.expires_at {
            Some(value) => OffsetDateTime::parse(&value, &Rfc3339)
                .map_err(|_| CredentialError::InvalidExpiry { value })?
                .unix_timestamp(),
            None => now + DEFAULT_TOKEN_LIFESPAN,
        };

        Ok(Token::new(body.token, expires_at))
    }
}

/// Locally persisted installation token cache.
///
/// There is no locking involved: concurrent processes may both exchange
/// a new token, in which case the last written one is kept.
pub struct CredentialCache {
    /// Path of the persisted token file.
    path: PathBuf,

    /// Token exchange used on cache misses.
    exchange: Box<dyn TokenExchange>,
}

impl CredentialCache {
    /// Create new cache stored inside the provided state directory.
    pub fn new(state_dir: &Path, exchange: Box<dyn TokenExchange>) -> Self {
        Self {
            path: state_dir.join(CREDENTIALS_FILE),
            exchange,
        }
    }

    /// Get a valid installation token, exchanging a new one if needed.
    pub fn get_token(&self) -> Result<Token, CredentialError> {
        self.token().map(|(token, _)| token)
    }

    /// Get a valid installation token together with its [`TokenSource`].
    pub fn token(&self) -> Result<(Token, TokenSource), CredentialError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();

        if let Some(token) = self.read_cached() {
            if token.is_fresh_at(now) {
                return Ok((token, TokenSource::Cached));
            }

            debug!(expires_at = token.expires_at, "cached token has expired");
        }

        info!("requesting new installation token");

        let token = self.exchange.exchange()?;
        self.persist(&token)?;

        Ok((token, TokenSource::Fresh))
    }

    /// Remove the persisted token, forcing the next call to perform an exchange.
    pub fn invalidate(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error.into()),
            _ => Ok(()),
        }
    }

    /// Read the persisted token, if any.
    ///
    /// Unreadable or malformed files are treated as a cache miss.
    fn read_cached(&self) -> Option<Token> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) => {
                if error.kind() != io::ErrorKind::NotFound {
                    warn!(%error, "unable to read cached token");
                }
                return None;
            }
        };

        serde_json::from_slice(&bytes)
            .map_err(|error| warn!(%error, "ignoring malformed cached token"))
            .ok()
    }

    /// Persist the token, creating the state directory if necessary.
    ///
    /// The token is written to an owner-only temporary file which then replaces
    /// the cache file, so the cache is never readable by other users.
    fn persist(&self, token: &Token) -> Result<(), CredentialError> {
        let directory = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(directory)?;

        let mut file = NamedTempFile::new_in(directory)?;
        file.write_all(&serde_json::to_vec_pretty(token)?)?;
        file.persist(&self.path).map_err(|error| error.error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, fs, rc::Rc};

    use common::config::Config;
    use tempfile::TempDir;
    use time::OffsetDateTime;

    use super::{
        CredentialCache, CredentialError, InstallationTokenExchange, Token, TokenExchange,
        TokenSource, CREDENTIALS_FILE,
    };

    struct CountingExchange {
        calls: Rc<Cell<usize>>,
        expires_at: i64,
    }

    impl TokenExchange for CountingExchange {
        fn exchange(&self) -> Result<Token, CredentialError> {
            self.calls.set(self.calls.get() + 1);
            Ok(Token::new(
                format!("fresh-{}", self.calls.get()),
                self.expires_at,
            ))
        }
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn cache(dir: &TempDir) -> (CredentialCache, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let cache = CredentialCache::new(
            dir.path(),
            Box::new(CountingExchange {
                calls: calls.clone(),
                expires_at: now() + 3600,
            }),
        );
        (cache, calls)
    }

    fn persist(dir: &TempDir, token: &Token) {
        fs::write(
            dir.path().join(CREDENTIALS_FILE),
            serde_json::to_vec(token).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn fresh_cached_token_is_reused() {
        let dir = TempDir::new().unwrap();
        let (cache, calls) = cache(&dir);

        let cached = Token::new(String::from("cached"), now() + 1800);
        persist(&dir, &cached);

        let (token, source) = cache.token().unwrap();

        assert_eq!(token, cached);
        assert_eq!(source, TokenSource::Cached);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn expired_token_is_exchanged_once_and_persisted() {
        let dir = TempDir::new().unwrap();
        let (cache, calls) = cache(&dir);

        persist(&dir, &Token::new(String::from("stale"), now() - 10));

        let token = cache.get_token().unwrap();

        assert_eq!(token.value(), "fresh-1");
        assert_eq!(calls.get(), 1);

        let persisted: Token =
            serde_json::from_slice(&fs::read(dir.path().join(CREDENTIALS_FILE)).unwrap())
                .unwrap();
        assert_eq!(persisted, token);

        // Second call is served from the newly persisted token.
        assert_eq!(cache.get_token().unwrap(), token);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn token_within_margin_is_refreshed() {
        let dir = TempDir::new().unwrap();
        let (cache, calls) = cache(&dir);

        persist(&dir, &Token::new(String::from("almost"), now() + 5));

        let (_, source) = cache.token().unwrap();

        assert_eq!(source, TokenSource::Fresh);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn missing_state_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested").join("state");
        let calls = Rc::new(Cell::new(0));
        let cache = CredentialCache::new(
            &nested,
            Box::new(CountingExchange {
                calls: calls.clone(),
                expires_at: now() + 3600,
            }),
        );

        cache.get_token().unwrap();

        assert!(nested.join(CREDENTIALS_FILE).exists());
    }

    #[cfg(unix)]
    #[test]
    fn persisted_token_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let (cache, _) = cache(&dir);

        persist(&dir, &Token::new(String::from("stale"), now() - 10));
        cache.get_token().unwrap();

        let mode = fs::metadata(dir.path().join(CREDENTIALS_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn malformed_cache_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let (cache, calls) = cache(&dir);

        fs::write(dir.path().join(CREDENTIALS_FILE), b"{not json").unwrap();

        cache.get_token().unwrap();

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn invalidate_forces_exchange() {
        let dir = TempDir::new().unwrap();
        let (cache, calls) = cache(&dir);

        persist(&dir, &Token::new(String::from("cached"), now() + 1800));
        cache.invalidate().unwrap();
        cache.invalidate().unwrap();

        cache.get_token().unwrap();

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn debug_output_redacts_value() {
        let token = Token::new(String::from("ghs_secret"), 0);

        assert!(!format!("{token:?}").contains("ghs_secret"));
    }

    #[test]
    fn unreadable_signing_key_fails_before_exchange() {
        let dir = TempDir::new().unwrap();
        let config = Config::for_tests(dir.path().to_path_buf());
        let exchange = InstallationTokenExchange::new(&config);

        assert!(matches!(
            exchange.exchange(),
            Err(CredentialError::SigningKey { .. })
        ));
    }

    #[test]
    fn persisted_format_matches_cache_file_layout() {
        let json = serde_json::to_value(Token::new(String::from("v"), 1700000000)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({ "token": "v", "expires_at": 1700000000 })
        );
    }
}
