use std::{
    fs, io,
    path::{Path, PathBuf},
};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use derive_more::{Display, Error, From};
use rand::{thread_rng, RngCore};
use tracing::debug;

/// Name of the session file inside the local state directory.
const SESSION_FILE: &str = "user";

/// AES-GCM nonce length, in bytes.
const NONCE_LENGTH: usize = 12;

/// Local session errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum SessionError {
    /// IO-related error.
    Io(io::Error),

    /// Configured encryption key has an invalid length.
    #[display(fmt = "session encryption key must be exactly 32 bytes long")]
    InvalidKey,

    /// Unable to encrypt the username.
    #[display(fmt = "unable to encrypt the session")]
    Encryption,

    /// Stored session cannot be decrypted.
    #[display(fmt = "stored session is corrupted, log in again")]
    Corrupted,

    /// No user is logged in.
    #[display(fmt = "login required")]
    LoginRequired,
}

/// Username of the currently logged in operator, encrypted at rest.
///
/// The session file holds a random nonce followed by the AES-256-GCM ciphertext.
pub(crate) struct Session {
    /// Session file path.
    path: PathBuf,

    /// Cipher initialized with the configured key.
    cipher: Aes256Gcm,
}

impl Session {
    /// Create new session handle inside the provided state directory.
    pub fn new(state_dir: &Path, encryption_key: &str) -> Result<Self, SessionError> {
        let cipher = Aes256Gcm::new_from_slice(encryption_key.as_bytes())
            .map_err(|_| SessionError::InvalidKey)?;

        Ok(Self {
            path: state_dir.join(SESSION_FILE),
            cipher,
        })
    }

    /// Store the provided username as the current session.
    pub fn write(&self, username: &str) -> Result<(), SessionError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(&Nonce::from(nonce), username.as_bytes())
            .map_err(|_| SessionError::Encryption)?;

        let mut contents = nonce.to_vec();
        contents.extend_from_slice(&ciphertext);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&self.path, contents)?;

        debug!(path = %self.path.display(), "session stored");

        Ok(())
    }

    /// Get the current username, if any.
    pub fn current(&self) -> Result<Option<String>, SessionError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        if contents.len() < NONCE_LENGTH {
            return Err(SessionError::Corrupted);
        }

        let (nonce, ciphertext) = contents.split_at(NONCE_LENGTH);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SessionError::Corrupted)?;

        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| SessionError::Corrupted)
    }

    /// Get the current username, failing if nobody is logged in.
    pub fn require(&self) -> Result<String, SessionError> {
        self.current()?.ok_or(SessionError::LoginRequired)
    }

    /// Remove the current session.
    ///
    /// Returns `false` if there was no session to remove.
    pub fn clear(&self) -> Result<bool, SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{Session, SessionError, SESSION_FILE};

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn username_round_trips() {
        let dir = TempDir::new().unwrap();
        let session = Session::new(dir.path(), KEY).unwrap();

        session.write("alice").unwrap();

        assert_eq!(session.current().unwrap().as_deref(), Some("alice"));
        assert_eq!(session.require().unwrap(), "alice");
    }

    #[test]
    fn username_is_not_stored_in_plaintext() {
        let dir = TempDir::new().unwrap();
        let session = Session::new(dir.path(), KEY).unwrap();

        session.write("alice").unwrap();
        let first = fs::read(dir.path().join(SESSION_FILE)).unwrap();
        session.write("alice").unwrap();
        let second = fs::read(dir.path().join(SESSION_FILE)).unwrap();

        assert!(!first.windows(5).any(|window| window == b"alice"));
        assert_ne!(first, second);
    }

    #[test]
    fn missing_session_requires_login() {
        let dir = TempDir::new().unwrap();
        let session = Session::new(dir.path(), KEY).unwrap();

        assert!(session.current().unwrap().is_none());
        assert!(matches!(
            session.require(),
            Err(SessionError::LoginRequired)
        ));
    }

    #[test]
    fn tampered_session_is_rejected() {
        let dir = TempDir::new().unwrap();
        let session = Session::new(dir.path(), KEY).unwrap();
        session.write("alice").unwrap();

        let path = dir.path().join(SESSION_FILE);
        let mut contents = fs::read(&path).unwrap();
        let last = contents.len() - 1;
        contents[last] ^= 0x01;
        fs::write(&path, contents).unwrap();

        assert!(matches!(session.current(), Err(SessionError::Corrupted)));
    }

    #[test]
    fn other_key_cannot_read_session() {
        let dir = TempDir::new().unwrap();
        Session::new(dir.path(), KEY)
            .unwrap()
            .write("alice")
            .unwrap();

        let other = Session::new(dir.path(), "fedcba9876543210fedcba9876543210").unwrap();

        assert!(matches!(other.current(), Err(SessionError::Corrupted)));
    }

    #[test]
    fn short_key_is_rejected() {
        let dir = TempDir::new().unwrap();

        assert!(matches!(
            Session::new(dir.path(), "short"),
            Err(SessionError::InvalidKey)
        ));
    }

    #[test]
    fn clearing_reports_previous_session() {
        let dir = TempDir::new().unwrap();
        let session = Session::new(dir.path(), KEY).unwrap();
        session.write("alice").unwrap();

        assert!(session.clear().unwrap());
        assert!(!session.clear().unwrap());
        assert!(session.current().unwrap().is_none());
    }
}
