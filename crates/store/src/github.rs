//! GitHub REST API client for the backing repository.
//!
//! Only the handful of endpoints needed to treat a repository as a record
//! store are covered: contents (read and create/update a single file), and
//! the git data API (blobs, trees, commits, references) for atomic
//! multi-file commits.

use base64::{engine::general_purpose::STANDARD, Engine};
use common::config::Config;
use derive_more::{Display, Error, From};
use reqwest::{
    blocking::{Client, RequestBuilder, Response},
    header::{ACCEPT, AUTHORIZATION, USER_AGENT},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::credentials::{CredentialCache, CredentialError, TokenSource};

/// File mode used for every blob added to a tree.
const BLOB_MODE: &str = "100644";

/// Content encoding used by both the contents and the git data API.
const BASE64_ENCODING: &str = "base64";

/// Repository API errors.
#[derive(Debug, Display, From, Error)]
pub enum ApiError {
    /// HTTP client error.
    Http(reqwest::Error),

    /// Unable to (de)serialize a request or response body.
    Json(serde_json::Error),

    /// File content is not valid base64.
    Base64(base64::DecodeError),

    /// Unable to obtain an installation token.
    Credentials(CredentialError),

    /// Write was rejected, since the target was modified concurrently.
    #[from(ignore)]
    #[display(fmt = "{} was modified concurrently", path)]
    Conflict { path: String },

    /// Installation token was rejected.
    #[from(ignore)]
    #[display(fmt = "repository API rejected the credentials with status {}", status)]
    Unauthorized { status: u16 },

    /// Any other unsuccessful response.
    #[from(ignore)]
    #[display(fmt = "unexpected status {} from {}", status, url)]
    UnexpectedStatus { status: u16, url: String },

    /// Response did not have the expected shape, e.g. a directory was found instead of a file.
    #[from(ignore)]
    #[display(fmt = "unexpected content at {}", path)]
    UnexpectedContent { path: String },
}

/// Decoded file contents together with its blob sha.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContents {
    /// Raw file content.
    pub content: Vec<u8>,

    /// Blob sha of the content.
    pub sha: String,
}

/// Kind of a directory listing entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,

    /// Nested directory.
    Dir,

    /// Symbolic links, submodules.
    Other,
}

/// Single directory listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Entry name.
    pub name: String,

    /// Full path of the entry, relative to the repository root.
    pub path: String,

    /// Entry kind.
    pub kind: EntryKind,
}

/// Current branch tip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchTip {
    /// Tip commit sha.
    pub commit: String,

    /// Root tree sha of the tip commit.
    pub tree: String,
}

/// Blob entry to be added to a new tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// Path of the file, relative to the repository root.
    pub path: String,

    /// Blob sha.
    pub sha: String,
}

/// Minimal repository API used as a record store.
///
/// All methods operate on the configured branch.
pub trait RepositoryApi {
    /// Read a file, returning [`None`] if it does not exist.
    fn get_file(&self, path: &str) -> Result<Option<FileContents>, ApiError>;

    /// List a directory, returning [`None`] if it does not exist.
    fn list_directory(&self, path: &str) -> Result<Option<Vec<DirectoryEntry>>, ApiError>;

    /// Create a file (if `sha` is [`None`]) or update it (if `sha` matches the current blob).
    fn put_file(
        &self,
        path: &str,
        content: &[u8],
        sha: Option<&str>,
        message: &str,
    ) -> Result<(), ApiError>;

    /// Get the current branch tip.
    fn branch_tip(&self) -> Result<BranchTip, ApiError>;

    /// Create a blob, returning its sha.
    fn create_blob(&self, content: &[u8]) -> Result<String, ApiError>;

    /// Create a tree on top of `base_tree`, returning its sha.
    fn create_tree(&self, base_tree: &str, entries: &[TreeEntry]) -> Result<String, ApiError>;

    /// Create a commit object, returning its sha.
    fn create_commit(&self, message: &str, tree: &str, parents: &[&str])
        -> Result<String, ApiError>;

    /// Fast-forward the branch to `commit`.
    fn update_branch(&self, commit: &str) -> Result<(), ApiError>;
}

/// Interpretation of a response status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    NotFound,
    Conflict,
    Unauthorized,
    Unexpected,
}

/// Classify a response status.
///
/// `422 Unprocessable Entity` is reported by GitHub both when creating a file that
/// already exists and when a reference update is not a fast-forward, so
/// for conditional writes it is treated as a conflict.
fn classify(status: StatusCode, conditional_write: bool) -> Outcome {
    match status {
        status if status.is_success() => Outcome::Success,
        StatusCode::NOT_FOUND => Outcome::NotFound,
        StatusCode::CONFLICT => Outcome::Conflict,
        StatusCode::UNPROCESSABLE_ENTITY if conditional_write => Outcome::Conflict,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Outcome::Unauthorized,
        _ => Outcome::Unexpected,
    }
}

/// Decode base64 file content, as returned by the contents API.
///
/// GitHub wraps the encoded value with newlines, which are stripped first.
fn decode_content(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded.split_whitespace().collect();
    STANDARD.decode(compact)
}

/// JSON response body of a contents request.
#[derive(Deserialize)]
#[serde(untagged)]
enum ContentsResponse {
    /// Directory listing.
    Directory(Vec<ContentsEntry>),

    /// Single file.
    File(ContentsFile),
}

/// Single file returned by the contents API.
#[derive(Deserialize)]
struct ContentsFile {
    /// Blob sha.
    sha: String,

    /// Encoded content, empty for files too large to be inlined.
    #[serde(default)]
    content: Option<String>,

    /// Content encoding, `none` when the content was not inlined.
    #[serde(default)]
    encoding: Option<String>,
}

/// JSON response body of a blob request.
#[derive(Deserialize)]
struct BlobResponse {
    /// Encoded content.
    content: String,

    /// Content encoding.
    encoding: String,
}

/// Directory listing entry returned by the contents API.
#[derive(Deserialize)]
struct ContentsEntry {
    /// Entry name.
    name: String,

    /// Entry path.
    path: String,

    /// Entry type (`file`, `dir`, `symlink`, `submodule`).
    #[serde(rename = "type")]
    kind: String,
}

/// JSON request body used to create or update a file.
#[derive(Serialize)]
struct PutFileRequest<'a> {
    /// Commit message.
    message: &'a str,

    /// Base64-encoded content.
    content: String,

    /// Target branch.
    branch: &'a str,

    /// Current blob sha, required for updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

/// JSON response body of a branch request.
#[derive(Deserialize)]
struct BranchResponse {
    /// Tip commit.
    commit: BranchCommit,
}

/// Tip commit of a branch response.
#[derive(Deserialize)]
struct BranchCommit {
    /// Commit sha.
    sha: String,

    /// Commit details.
    commit: BranchCommitDetails,
}

/// Details of a tip commit.
#[derive(Deserialize)]
struct BranchCommitDetails {
    /// Root tree.
    tree: ShaResponse,
}

/// Any git data API response that carries a sha.
#[derive(Deserialize)]
struct ShaResponse {
    /// Object sha.
    sha: String,
}

/// JSON request body used to create a blob.
#[derive(Serialize)]
struct CreateBlobRequest {
    /// Base64-encoded content.
    content: String,

    /// Content encoding.
    encoding: &'static str,
}

/// JSON request body used to create a tree.
#[derive(Serialize)]
struct CreateTreeRequest<'a> {
    /// Tree to build on top of.
    base_tree: &'a str,

    /// Added entries.
    tree: Vec<CreateTreeEntry<'a>>,
}

/// Single entry of a tree creation request.
#[derive(Serialize)]
struct CreateTreeEntry<'a> {
    /// File path.
    path: &'a str,

    /// File mode.
    mode: &'static str,

    /// Object type.
    #[serde(rename = "type")]
    kind: &'static str,

    /// Blob sha.
    sha: &'a str,
}

/// JSON request body used to create a commit.
#[derive(Serialize)]
struct CreateCommitRequest<'a> {
    /// Commit message.
    message: &'a str,

    /// Root tree.
    tree: &'a str,

    /// Parent commits.
    parents: &'a [&'a str],
}

/// JSON request body used to update a reference.
#[derive(Serialize)]
struct UpdateReferenceRequest<'a> {
    /// New target commit.
    sha: &'a str,

    /// Whether non-fast-forward updates are allowed.
    force: bool,
}

/// [`RepositoryApi`] implementation backed by the GitHub REST API.
pub struct GitHubClient {
    /// HTTP client.
    http: Client,

    /// Installation token cache.
    credentials: CredentialCache,

    /// Repository base URL (`{api}/repos/{owner}/{name}`).
    repository_url: String,

    /// Branch used as the record store.
    branch: String,
}

impl GitHubClient {
    /// Create new client using the repository section of the configuration.
    pub fn new(config: &Config, credentials: CredentialCache) -> Self {
        Self {
            http: Client::new(),
            credentials,
            repository_url: format!(
                "{}/repos/{}/{}",
                config.repository.api_url.trim_end_matches('/'),
                config.repository.owner,
                config.repository.name
            ),
            branch: config.repository.branch.clone(),
        }
    }

    /// Send an authenticated request.
    ///
    /// If a cached token is rejected, the cache is invalidated and the request
    /// is repeated exactly once with a freshly exchanged token. A rejection of
    /// a fresh token is returned to the caller as is.
    fn send<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let (token, source) = self.credentials.token()?;

        let response = self.authorize(build(&self.http), token.value()).send()?;

        if source == TokenSource::Cached
            && classify(response.status(), false) == Outcome::Unauthorized
        {
            warn!(
                status = response.status().as_u16(),
                "cached installation token was rejected, requesting a new one"
            );

            self.credentials.invalidate()?;
            let token = self.credentials.get_token()?;

            return Ok(self.authorize(build(&self.http), token.value()).send()?);
        }

        Ok(response)
    }

    /// Attach authentication and common headers.
    fn authorize(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .header(AUTHORIZATION, format!("token {token}"))
            .header(ACCEPT, "application/vnd.github.v3+json")
            .header(USER_AGENT, "send-cli")
    }

    /// URL of a contents API path.
    fn contents_url(&self, path: &str) -> String {
        format!("{}/contents/{}", self.repository_url, path.trim_matches('/'))
    }

    /// URL of a git data API path.
    fn git_url(&self, path: &str) -> String {
        format!("{}/git/{}", self.repository_url, path)
    }

    /// Fetch contents at path, returning [`None`] on `404 Not Found`.
    fn get_contents(&self, path: &str) -> Result<Option<ContentsResponse>, ApiError> {
        let url = self.contents_url(path);

        debug!(%url, "reading contents");

        let response = self.send(|http| http.get(&url).query(&[("ref", &self.branch)]))?;

        match classify(response.status(), false) {
            Outcome::Success => Ok(Some(response.json()?)),
            Outcome::NotFound => Ok(None),
            outcome => Err(self.failure(outcome, response.status(), &url, path)),
        }
    }

    /// Read blob content by its sha.
    fn get_blob(&self, sha: &str, path: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.git_url(&format!("blobs/{sha}"));
        let response = self.send(|http| http.get(&url))?;
        let blob: BlobResponse = self.expect_success(response, &url, false)?;

        match blob.encoding.as_str() {
            BASE64_ENCODING => Ok(decode_content(&blob.content)?),
            "utf-8" => Ok(blob.content.into_bytes()),
            _ => Err(ApiError::UnexpectedContent {
                path: path.to_owned(),
            }),
        }
    }

    /// POST a JSON body to the git data API, returning the created object sha.
    fn create_object<B: Serialize>(&self, path: &str, body: &B) -> Result<String, ApiError> {
        let url = self.git_url(path);
        let response = self.send(|http| http.post(&url).json(body))?;
        let created: ShaResponse = self.expect_success(response, &url, false)?;
        Ok(created.sha)
    }

    /// Deserialize a successful response, mapping failures onto [`ApiError`].
    fn expect_success<T: DeserializeOwned>(
        &self,
        response: Response,
        url: &str,
        conditional_write: bool,
    ) -> Result<T, ApiError> {
        match classify(response.status(), conditional_write) {
            Outcome::Success => Ok(response.json()?),
            outcome => Err(self.failure(outcome, response.status(), url, url)),
        }
    }

    /// Convert an unsuccessful [`Outcome`] into an [`ApiError`].
    fn failure(&self, outcome: Outcome, status: StatusCode, url: &str, path: &str) -> ApiError {
        match outcome {
            Outcome::Conflict => ApiError::Conflict {
                path: path.to_owned(),
            },
            Outcome::Unauthorized => ApiError::Unauthorized {
                status: status.as_u16(),
            },
            _ => ApiError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_owned(),
            },
        }
    }
}

impl RepositoryApi for GitHubClient {
    fn get_file(&self, path: &str) -> Result<Option<FileContents>, ApiError> {
        let file = match self.get_contents(path)? {
            Some(ContentsResponse::File(file)) => file,
            Some(ContentsResponse::Directory(_)) => {
                return Err(ApiError::UnexpectedContent {
                    path: path.to_owned(),
                })
            }
            None => return Ok(None),
        };

        let content = match (file.encoding.as_deref(), file.content) {
            (None | Some(BASE64_ENCODING), Some(content)) => decode_content(&content)?,
            // Files over 1 MB are not inlined by the contents API.
            _ => {
                debug!(path, sha = %file.sha, "content not inlined, reading blob");
                self.get_blob(&file.sha, path)?
            }
        };

        Ok(Some(FileContents {
            content,
            sha: file.sha,
        }))
    }

    fn list_directory(&self, path: &str) -> Result<Option<Vec<DirectoryEntry>>, ApiError> {
        match self.get_contents(path)? {
            Some(ContentsResponse::Directory(entries)) => Ok(Some(
                entries
                    .into_iter()
                    .map(|entry| DirectoryEntry {
                        kind: match &*entry.kind {
                            "file" => EntryKind::File,
                            "dir" => EntryKind::Dir,
                            _ => EntryKind::Other,
                        },
                        name: entry.name,
                        path: entry.path,
                    })
                    .collect(),
            )),
            Some(ContentsResponse::File(_)) => Err(ApiError::UnexpectedContent {
                path: path.to_owned(),
            }),
            None => Ok(None),
        }
    }

    fn put_file(
        &self,
        path: &str,
        content: &[u8],
        sha: Option<&str>,
        message: &str,
    ) -> Result<(), ApiError> {
        let url = self.contents_url(path);

        let body = PutFileRequest {
            message,
            content: STANDARD.encode(content),
            branch: &self.branch,
            sha,
        };

        debug!(%url, update = sha.is_some(), "writing contents");

        let response = self.send(|http| http.put(&url).json(&body))?;

        match classify(response.status(), true) {
            Outcome::Success => Ok(()),
            outcome => Err(self.failure(outcome, response.status(), &url, path)),
        }
    }

    fn branch_tip(&self) -> Result<BranchTip, ApiError> {
        let url = format!("{}/branches/{}", self.repository_url, self.branch);
        let response = self.send(|http| http.get(&url))?;
        let branch: BranchResponse = self.expect_success(response, &url, false)?;

        Ok(BranchTip {
            commit: branch.commit.sha,
            tree: branch.commit.commit.tree.sha,
        })
    }

    fn create_blob(&self, content: &[u8]) -> Result<String, ApiError> {
        self.create_object(
            "blobs",
            &CreateBlobRequest {
                content: STANDARD.encode(content),
                encoding: BASE64_ENCODING,
            },
        )
    }

    fn create_tree(&self, base_tree: &str, entries: &[TreeEntry]) -> Result<String, ApiError> {
        self.create_object(
            "trees",
            &CreateTreeRequest {
                base_tree,
                tree: entries
                    .iter()
                    .map(|entry| CreateTreeEntry {
                        path: &entry.path,
                        mode: BLOB_MODE,
                        kind: "blob",
                        sha: &entry.sha,
                    })
                    .collect(),
            },
        )
    }

    fn create_commit(
        &self,
        message: &str,
        tree: &str,
        parents: &[&str],
    ) -> Result<String, ApiError> {
        self.create_object(
            "commits",
            &CreateCommitRequest {
                message,
                tree,
                parents,
            },
        )
    }

    fn update_branch(&self, commit: &str) -> Result<(), ApiError> {
        let url = self.git_url(&format!("refs/heads/{}", self.branch));

        let body = UpdateReferenceRequest {
            sha: commit,
            force: false,
        };

        let response = self.send(|http| http.patch(&url).json(&body))?;

        match classify(response.status(), true) {
            Outcome::Success => Ok(()),
            outcome => Err(self.failure(
                outcome,
                response.status(),
                &url,
                &format!("refs/heads/{}", self.branch),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use common::config::Config;
    use reqwest::StatusCode;
    use tempfile::TempDir;
    use time::OffsetDateTime;

    use super::{
        classify, decode_content, ApiError, ContentsResponse, GitHubClient, Outcome,
        RepositoryApi,
    };
    use crate::{
        credentials::{CredentialCache, CredentialError, Token, TokenExchange, CREDENTIALS_FILE},
        testing::HttpStub,
    };

    struct FixedExchange;

    impl TokenExchange for FixedExchange {
        fn exchange(&self) -> Result<Token, CredentialError> {
            Ok(Token::new(String::from("fresh"), now() + 3600))
        }
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    /// Client talking to `stub`, with a cached token unless `cached` is [`None`].
    fn client(dir: &TempDir, stub: &HttpStub, cached: Option<&str>) -> GitHubClient {
        if let Some(value) = cached {
            fs::write(
                dir.path().join(CREDENTIALS_FILE),
                serde_json::to_vec(&Token::new(value.to_owned(), now() + 1800)).unwrap(),
            )
            .unwrap();
        }

        let mut config = Config::for_tests(dir.path().to_path_buf());
        config.repository.api_url = stub.url().to_owned();

        GitHubClient::new(
            &config,
            CredentialCache::new(dir.path(), Box::new(FixedExchange)),
        )
    }

    fn file_body(content: &str, encoding: &str) -> String {
        format!(
            r#"{{"type": "file", "name": "hosts", "path": "app/hosts", "sha": "abc", "content": "{content}", "encoding": "{encoding}"}}"#
        )
    }

    fn authorizations(stub: HttpStub) -> Vec<String> {
        stub.requests()
            .iter()
            .map(|request| request.header("authorization").unwrap_or_default().to_owned())
            .collect()
    }

    #[test]
    fn rejected_cached_token_is_refreshed_once() {
        let dir = TempDir::new().unwrap();
        let stub = HttpStub::serve(vec![
            (401, String::from(r#"{"message": "Bad credentials"}"#)),
            (200, file_body("eA==", "base64")),
        ])
        .unwrap();
        let client = client(&dir, &stub, Some("cached"));

        let file = client.get_file("app/hosts").unwrap().unwrap();

        assert_eq!(file.content, b"x");
        assert_eq!(authorizations(stub), vec!["token cached", "token fresh"]);

        let persisted: Token =
            serde_json::from_slice(&fs::read(dir.path().join(CREDENTIALS_FILE)).unwrap())
                .unwrap();
        assert_eq!(persisted.value(), "fresh");
    }

    #[test]
    fn rejected_fresh_token_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let stub = HttpStub::serve(vec![
            (401, String::from(r#"{"message": "Bad credentials"}"#)),
            (401, String::from(r#"{"message": "Bad credentials"}"#)),
        ])
        .unwrap();
        let client = client(&dir, &stub, Some("cached"));

        assert!(matches!(
            client.get_file("app/hosts"),
            Err(ApiError::Unauthorized { status: 401 })
        ));
        assert_eq!(authorizations(stub), vec!["token cached", "token fresh"]);
    }

    #[test]
    fn first_fresh_token_rejection_is_final() {
        let dir = TempDir::new().unwrap();
        let stub = HttpStub::serve(vec![(403, String::from("{}"))]).unwrap();
        let client = client(&dir, &stub, None);

        assert!(matches!(
            client.get_file("app/hosts"),
            Err(ApiError::Unauthorized { status: 403 })
        ));
        assert_eq!(authorizations(stub), vec!["token fresh"]);
    }

    #[test]
    fn large_file_is_read_from_blob() {
        let dir = TempDir::new().unwrap();
        let stub = HttpStub::serve(vec![
            (200, file_body("", "none")),
            (
                200,
                String::from(r#"{"sha": "abc", "content": "W21hbmFnZXJd\nCg==\n", "encoding": "base64"}"#),
            ),
        ])
        .unwrap();
        let client = client(&dir, &stub, Some("cached"));

        let file = client.get_file("app/hosts").unwrap().unwrap();

        assert_eq!(file.content, b"[manager]\n");
        assert_eq!(file.sha, "abc");

        let requests = stub.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].target,
            "/repos/cuappdev/send-devops/git/blobs/abc"
        );
    }

    #[test]
    fn unknown_blob_encoding_is_rejected() {
        let dir = TempDir::new().unwrap();
        let stub = HttpStub::serve(vec![
            (200, file_body("", "none")),
            (200, String::from(r#"{"sha": "abc", "content": "", "encoding": "none"}"#)),
        ])
        .unwrap();
        let client = client(&dir, &stub, Some("cached"));

        assert!(matches!(
            client.get_file("app/hosts"),
            Err(ApiError::UnexpectedContent { path }) if path == "app/hosts"
        ));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify(StatusCode::OK, false), Outcome::Success);
        assert_eq!(classify(StatusCode::CREATED, true), Outcome::Success);
        assert_eq!(classify(StatusCode::NOT_FOUND, false), Outcome::NotFound);
        assert_eq!(classify(StatusCode::CONFLICT, false), Outcome::Conflict);
        assert_eq!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, true),
            Outcome::Conflict
        );
        assert_eq!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, false),
            Outcome::Unexpected
        );
        assert_eq!(
            classify(StatusCode::UNAUTHORIZED, false),
            Outcome::Unauthorized
        );
        assert_eq!(classify(StatusCode::FORBIDDEN, true), Outcome::Unauthorized);
        assert_eq!(
            classify(StatusCode::INTERNAL_SERVER_ERROR, false),
            Outcome::Unexpected
        );
    }

    #[test]
    fn wrapped_content_is_decoded() {
        let encoded = "W21hbmFnZXJd\nCjIwMy4wLjEx\nMy41Cg==\n";

        assert_eq!(
            decode_content(encoded).unwrap(),
            b"[manager]\n203.0.113.5\n"
        );
    }

    #[test]
    fn contents_response_shapes() {
        let file: ContentsResponse = serde_json::from_str(
            r#"{"type": "file", "name": "hosts", "path": "app/hosts", "sha": "abc", "content": "eA=="}"#,
        )
        .unwrap();
        assert!(matches!(file, ContentsResponse::File(ref f) if f.sha == "abc"));

        let directory: ContentsResponse = serde_json::from_str(
            r#"[{"type": "file", "name": "a", "path": "app/a", "sha": "1"},
                {"type": "dir", "name": "b", "path": "app/b", "sha": "2"}]"#,
        )
        .unwrap();
        assert!(matches!(directory, ContentsResponse::Directory(ref d) if d.len() == 2));
    }
}
