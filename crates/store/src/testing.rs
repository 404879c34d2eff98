//! Test doubles used by unit tests.
//!
//! [`MemoryRepository`] is an in-memory [`RepositoryApi`] that enforces the same
//! preconditions GitHub does: creating an existing file or updating with a stale
//! sha is a conflict, and a branch can only be fast-forwarded.
//!
//! [`HttpStub`] serves canned HTTP responses on a local port and records the
//! requests it receives.

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::github::{
    ApiError, BranchTip, DirectoryEntry, EntryKind, FileContents, RepositoryApi, TreeEntry,
};

/// Stored commit object.
struct Commit {
    tree: String,
    parents: Vec<String>,
    message: String,
}

#[derive(Default)]
struct State {
    blobs: HashMap<String, Vec<u8>>,
    trees: HashMap<String, BTreeMap<String, String>>,
    commits: HashMap<String, Commit>,
    tip: String,
    next_id: u64,
    race_next_branch_update: bool,
}

impl State {
    fn object_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:040x}", self.next_id)
    }

    fn tip_tree(&self) -> &BTreeMap<String, String> {
        &self.trees[&self.commits[&self.tip].tree]
    }

    /// Commit `files` on top of the tip and move the tip.
    fn commit_on_tip(&mut self, files: &[(&str, &[u8])], message: &str) -> String {
        let mut tree = if self.tip.is_empty() {
            BTreeMap::new()
        } else {
            self.tip_tree().clone()
        };

        for (path, content) in files {
            let blob = self.object_id();
            self.blobs.insert(blob.clone(), content.to_vec());
            tree.insert(path.to_string(), blob);
        }

        let tree_id = self.object_id();
        self.trees.insert(tree_id.clone(), tree);

        let parents = if self.tip.is_empty() {
            Vec::new()
        } else {
            vec![self.tip.clone()]
        };

        let commit = self.object_id();
        self.commits.insert(
            commit.clone(),
            Commit {
                tree: tree_id,
                parents,
                message: message.to_owned(),
            },
        );
        self.tip = commit.clone();

        commit
    }
}

/// Shared in-memory repository; clones refer to the same state.
#[derive(Clone)]
pub struct MemoryRepository {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    /// Create a repository with a single empty root commit.
    pub fn new() -> Self {
        let mut state = State::default();
        state.commit_on_tip(&[], "Initial commit");

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Create a repository with one commit holding `files` on top of the root commit.
    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let repository = Self::new();
        let files: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(path, content)| (*path, content.as_bytes()))
            .collect();

        repository.lock().commit_on_tip(&files, "Seed files");
        repository
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("repository state poisoned")
    }

    /// Current tip commit.
    pub fn tip(&self) -> String {
        self.lock().tip.clone()
    }

    /// Parents of a commit.
    pub fn parents(&self, commit: &str) -> Vec<String> {
        self.lock().commits[commit].parents.clone()
    }

    /// Content of a file at the tip.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        let blob = state.tip_tree().get(path)?;
        Some(state.blobs[blob].clone())
    }

    /// Paths of every file at the tip.
    pub fn paths(&self) -> Vec<String> {
        self.lock().tip_tree().keys().cloned().collect()
    }

    /// Count of commits reachable from the tip through first parents.
    pub fn commit_count(&self) -> usize {
        self.messages().len()
    }

    /// Messages of commits reachable from the tip through first parents, newest first.
    pub fn messages(&self) -> Vec<String> {
        let state = self.lock();
        let mut messages = Vec::new();
        let mut current = Some(state.tip.clone());

        while let Some(sha) = current {
            let commit = &state.commits[&sha];
            messages.push(commit.message.clone());
            current = commit.parents.first().cloned();
        }

        messages
    }

    /// Make another writer move the branch right before the next reference update.
    pub fn race_next_branch_update(&self) {
        self.lock().race_next_branch_update = true;
    }
}

fn conflict(path: &str) -> ApiError {
    ApiError::Conflict {
        path: path.to_owned(),
    }
}

fn unprocessable(url: &str) -> ApiError {
    ApiError::UnexpectedStatus {
        status: 422,
        url: url.to_owned(),
    }
}

impl RepositoryApi for MemoryRepository {
    fn get_file(&self, path: &str) -> Result<Option<FileContents>, ApiError> {
        let state = self.lock();
        let tree = state.tip_tree();

        if let Some(sha) = tree.get(path) {
            return Ok(Some(FileContents {
                content: state.blobs[sha].clone(),
                sha: sha.clone(),
            }));
        }

        let prefix = format!("{path}/");
        if tree.keys().any(|key| key.starts_with(&prefix)) {
            return Err(ApiError::UnexpectedContent {
                path: path.to_owned(),
            });
        }

        Ok(None)
    }

    fn list_directory(&self, path: &str) -> Result<Option<Vec<DirectoryEntry>>, ApiError> {
        let state = self.lock();
        let tree = state.tip_tree();
        let path = path.trim_matches('/');

        if tree.contains_key(path) {
            return Err(ApiError::UnexpectedContent {
                path: path.to_owned(),
            });
        }

        let prefix = format!("{path}/");
        let mut entries = BTreeMap::new();

        for key in tree.keys().filter(|key| key.starts_with(&prefix)) {
            let rest = &key[prefix.len()..];

            let (name, kind) = match rest.split_once('/') {
                Some((dir, _)) => (dir, EntryKind::Dir),
                None => (rest, EntryKind::File),
            };

            entries.entry(name.to_owned()).or_insert(DirectoryEntry {
                name: name.to_owned(),
                path: format!("{prefix}{name}"),
                kind,
            });
        }

        Ok((!entries.is_empty()).then(|| entries.into_values().collect()))
    }

    fn put_file(
        &self,
        path: &str,
        content: &[u8],
        sha: Option<&str>,
        message: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.lock();
        let current = state.tip_tree().get(path).cloned();

        match (current.as_deref(), sha) {
            (None, None) => {}
            (Some(current), Some(sha)) if current == sha => {}
            _ => return Err(conflict(path)),
        }

        state.commit_on_tip(&[(path, content)], message);

        Ok(())
    }

    fn branch_tip(&self) -> Result<BranchTip, ApiError> {
        let state = self.lock();

        Ok(BranchTip {
            commit: state.tip.clone(),
            tree: state.commits[&state.tip].tree.clone(),
        })
    }

    fn create_blob(&self, content: &[u8]) -> Result<String, ApiError> {
        let mut state = self.lock();
        let sha = state.object_id();
        state.blobs.insert(sha.clone(), content.to_vec());
        Ok(sha)
    }

    fn create_tree(&self, base_tree: &str, entries: &[TreeEntry]) -> Result<String, ApiError> {
        let mut state = self.lock();

        let mut tree = state
            .trees
            .get(base_tree)
            .cloned()
            .ok_or_else(|| unprocessable("trees"))?;

        for entry in entries {
            if !state.blobs.contains_key(&entry.sha) {
                return Err(unprocessable("trees"));
            }
            tree.insert(entry.path.clone(), entry.sha.clone());
        }

        let sha = state.object_id();
        state.trees.insert(sha.clone(), tree);
        Ok(sha)
    }

    fn create_commit(
        &self,
        message: &str,
        tree: &str,
        parents: &[&str],
    ) -> Result<String, ApiError> {
        let mut state = self.lock();

        if !state.trees.contains_key(tree)
            || parents.iter().any(|parent| !state.commits.contains_key(*parent))
        {
            return Err(unprocessable("commits"));
        }

        let sha = state.object_id();
        state.commits.insert(
            sha.clone(),
            Commit {
                tree: tree.to_owned(),
                parents: parents.iter().map(|parent| parent.to_string()).collect(),
                message: message.to_owned(),
            },
        );
        Ok(sha)
    }

    fn update_branch(&self, commit: &str) -> Result<(), ApiError> {
        let mut state = self.lock();

        if state.race_next_branch_update {
            state.race_next_branch_update = false;
            state.commit_on_tip(&[("concurrent.txt", &b"concurrent"[..])], "Concurrent change");
        }

        let fast_forward = state
            .commits
            .get(commit)
            .map(|commit| commit.parents.contains(&state.tip))
            .unwrap_or(false);

        if !fast_forward {
            return Err(conflict("refs/heads/master"));
        }

        state.tip = commit.to_owned();

        Ok(())
    }
}

/// How long [`HttpStub`] waits for each expected connection.
const STUB_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP request received by [`HttpStub`].
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    /// Request method.
    pub method: String,

    /// Request target, including the query string.
    pub target: String,

    /// Header names (lowercase) and values.
    pub headers: Vec<(String, String)>,

    /// Request body.
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Get the first value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();

        self.headers
            .iter()
            .find(|(header, _)| *header == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Local HTTP server answering one connection per canned response, in order.
///
/// The server stops after the last response, so any extra request fails to connect.
pub struct HttpStub {
    /// Base URL of the server.
    url: String,

    /// Serving thread, yielding the recorded requests.
    handle: JoinHandle<Vec<RecordedRequest>>,
}

impl HttpStub {
    /// Start serving `responses`, each a status code and a JSON body.
    pub fn serve(responses: Vec<(u16, String)>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let url = format!("http://{}", listener.local_addr()?);

        let handle = thread::spawn(move || {
            let mut requests = Vec::new();

            for (status, body) in responses {
                let Some(stream) = accept(&listener) else {
                    break;
                };

                match answer(stream, status, &body) {
                    Ok(request) => requests.push(request),
                    Err(_) => break,
                }
            }

            requests
        });

        Ok(Self { url, handle })
    }

    /// Base URL of the server, without a trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait for the server to stop, returning every request it received.
    pub fn requests(self) -> Vec<RecordedRequest> {
        self.handle.join().unwrap_or_default()
    }
}

/// Accept a single connection, giving up after [`STUB_ACCEPT_TIMEOUT`].
fn accept(listener: &TcpListener) -> Option<TcpStream> {
    let deadline = Instant::now() + STUB_ACCEPT_TIMEOUT;

    loop {
        match listener.accept() {
            Ok((stream, _)) => return stream.set_nonblocking(false).ok().map(|_| stream),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return None,
        }
    }
}

/// Read a single request from `stream` and answer it.
fn answer(stream: TcpStream, status: u16, body: &str) -> io::Result<RecordedRequest> {
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let target = parts.next().unwrap_or_default().to_owned();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();

        if line.is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }
    }

    let length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);
    let mut request_body = vec![0; length];
    reader.read_exact(&mut request_body)?;

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()?;

    Ok(RecordedRequest {
        method,
        target,
        headers,
        body: request_body,
    })
}
