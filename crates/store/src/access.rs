//! Users and app grants.
//!
//! Every user is a JSON record at `users/<username>.json`. Records are
//! created at signup and mutated only through read-modify-write with the
//! revision tag read in the same operation.

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::records::{RecordStore, RevisionTag, StoreError};

/// Access control errors.
#[derive(Debug, Display, From, Error)]
pub enum AccessError {
    /// Record store error.
    Store(StoreError),

    /// Password hashing error.
    Hash(bcrypt::BcryptError),

    /// User with such name is already registered.
    #[from(ignore)]
    #[display(fmt = "user {} already exists", username)]
    UserExists { username: String },

    /// User with such name does not exist.
    #[from(ignore)]
    #[display(fmt = "user {} does not exist", username)]
    UnknownUser { username: String },

    /// Username is not usable as a record key.
    #[from(ignore)]
    #[display(fmt = "invalid username {:?}", username)]
    InvalidUsername { username: String },
}

/// Stored user record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    /// Unique username.
    pub username: String,

    /// Bcrypt password hash.
    pub hashed_password: String,

    /// Apps the user was granted access to.
    #[serde(default)]
    pub apps: Vec<String>,

    /// Whether the user can grant access and provision servers.
    #[serde(default)]
    pub is_admin: bool,
}

/// How a login attempt for a username without a record is reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnknownUserPolicy {
    /// Report the attempt as invalid credentials.
    #[default]
    CollapseToInvalid,

    /// Fail with [`AccessError::UnknownUser`].
    Reject,
}

/// Result of an app grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    /// App was added to the user's grants.
    Granted,

    /// User already had access, nothing was written.
    AlreadyGranted,
}

/// Get the record path of a user.
pub fn user_path(username: &str) -> String {
    format!("users/{username}.json")
}

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String, AccessError> {
    Ok(bcrypt::hash(password, bcrypt::DEFAULT_COST)?)
}

fn validate_username(username: &str) -> Result<(), AccessError> {
    let valid = !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !username.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(AccessError::InvalidUsername {
            username: username.to_owned(),
        })
    }
}

/// Access control on top of a [`RecordStore`].
pub struct AccessControl<'a> {
    store: &'a RecordStore,
    policy: UnknownUserPolicy,
}

impl<'a> AccessControl<'a> {
    /// Create new access control with the default [`UnknownUserPolicy`].
    pub fn new(store: &'a RecordStore) -> Self {
        Self::with_policy(store, UnknownUserPolicy::default())
    }

    /// Create new access control with an explicit [`UnknownUserPolicy`].
    pub fn with_policy(store: &'a RecordStore, policy: UnknownUserPolicy) -> Self {
        Self { store, policy }
    }

    fn read_user(&self, username: &str) -> Result<Option<(UserRecord, RevisionTag)>, AccessError> {
        validate_username(username)?;
        Ok(self.store.read_json(&user_path(username))?)
    }

    /// Get user record.
    pub fn user(&self, username: &str) -> Result<UserRecord, AccessError> {
        self.read_user(username)?
            .map(|(user, _)| user)
            .ok_or_else(|| AccessError::UnknownUser {
                username: username.to_owned(),
            })
    }

    /// Verify the provided credentials.
    ///
    /// Returns the user record, if found, and whether the password matched.
    pub fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(Option<UserRecord>, bool), AccessError> {
        let user = match self.read_user(username) {
            Ok(Some((user, _))) => user,
            Ok(None) | Err(AccessError::InvalidUsername { .. })
                if self.policy == UnknownUserPolicy::CollapseToInvalid =>
            {
                debug!(username, "login attempt for unknown user");
                return Ok((None, false));
            }
            Ok(None) => {
                return Err(AccessError::UnknownUser {
                    username: username.to_owned(),
                })
            }
            Err(error) => return Err(error),
        };

        let valid = bcrypt::verify(password, &user.hashed_password)?;

        Ok((Some(user), valid))
    }

    /// Register a new non-admin user with no grants.
    pub fn register_user(&self, username: &str, password_hash: &str) -> Result<(), AccessError> {
        if self.read_user(username)?.is_some() {
            return Err(AccessError::UserExists {
                username: username.to_owned(),
            });
        }

        let user = UserRecord {
            username: username.to_owned(),
            hashed_password: password_hash.to_owned(),
            apps: Vec::new(),
            is_admin: false,
        };

        let result = self.store.write_json(
            &user_path(username),
            &user,
            None,
            &format!("Register user {username}"),
        );

        match result {
            Ok(()) => {
                info!(username, "user registered");
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => Err(AccessError::UserExists {
                username: username.to_owned(),
            }),
            Err(error) => Err(error.into()),
        }
    }

    /// Grant a user access to an app.
    pub fn grant_app_access(&self, username: &str, app: &str) -> Result<GrantOutcome, AccessError> {
        let (mut user, revision) =
            self.read_user(username)?
                .ok_or_else(|| AccessError::UnknownUser {
                    username: username.to_owned(),
                })?;

        if user.apps.iter().any(|granted| granted == app) {
            debug!(username, app, "access already granted");
            return Ok(GrantOutcome::AlreadyGranted);
        }

        user.apps.push(app.to_owned());

        self.store.write_json(
            &user_path(username),
            &user,
            Some(&revision),
            &format!("Grant app access to {app} for {username}"),
        )?;

        info!(username, app, "access granted");

        Ok(GrantOutcome::Granted)
    }

    /// Check if a user was granted access to an app.
    pub fn has_access(&self, username: &str, app: &str) -> Result<bool, AccessError> {
        Ok(self.user(username)?.apps.iter().any(|granted| granted == app))
    }

    /// Check if a user is an administrator.
    pub fn is_admin(&self, username: &str) -> Result<bool, AccessError> {
        Ok(self.user(username)?.is_admin)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        user_path, AccessControl, AccessError, GrantOutcome, UnknownUserPolicy, UserRecord,
    };
    use crate::{records::RecordStore, testing::MemoryRepository};

    // Lowest cost bcrypt accepts, keeps tests fast.
    const TEST_COST: u32 = 4;

    fn user_json(username: &str, password: &str, apps: &[&str], is_admin: bool) -> String {
        serde_json::to_string(&UserRecord {
            username: username.to_owned(),
            hashed_password: bcrypt::hash(password, TEST_COST).unwrap(),
            apps: apps.iter().map(|app| app.to_string()).collect(),
            is_admin,
        })
        .unwrap()
    }

    fn repository_with_alice() -> MemoryRepository {
        let alice = user_json("alice", "rightpw", &["bar"], false);
        MemoryRepository::with_files(&[("users/alice.json", alice.as_str())])
    }

    fn store(repository: &MemoryRepository) -> RecordStore {
        RecordStore::new(Box::new(repository.clone()))
    }

    #[test]
    fn matching_password_verifies() {
        let repository = repository_with_alice();
        let store = store(&repository);
        let access = AccessControl::new(&store);

        let (user, valid) = access.verify_credentials("alice", "rightpw").unwrap();

        assert!(valid);
        assert_eq!(user.unwrap().username, "alice");
    }

    #[test]
    fn wrong_password_is_invalid() {
        let repository = repository_with_alice();
        let store = store(&repository);
        let access = AccessControl::new(&store);

        let (_, valid) = access.verify_credentials("alice", "wrongpw").unwrap();

        assert!(!valid);
    }

    #[test]
    fn unknown_user_follows_policy() {
        let repository = repository_with_alice();
        let store = store(&repository);

        let (user, valid) = AccessControl::new(&store)
            .verify_credentials("mallory", "rightpw")
            .unwrap();
        assert!(user.is_none());
        assert!(!valid);

        assert!(matches!(
            AccessControl::with_policy(&store, UnknownUserPolicy::Reject)
                .verify_credentials("mallory", "rightpw"),
            Err(AccessError::UnknownUser { .. })
        ));
    }

    #[test]
    fn repeated_grant_is_idempotent() {
        let repository = repository_with_alice();
        let store = store(&repository);
        let access = AccessControl::new(&store);

        assert_eq!(
            access.grant_app_access("alice", "foo").unwrap(),
            GrantOutcome::Granted
        );
        let commits = repository.commit_count();

        assert_eq!(
            access.grant_app_access("alice", "foo").unwrap(),
            GrantOutcome::AlreadyGranted
        );
        assert_eq!(repository.commit_count(), commits);

        let user = access.user("alice").unwrap();
        assert_eq!(user.apps, vec!["bar", "foo"]);
    }

    #[test]
    fn grants_use_fresh_revision() {
        let repository = repository_with_alice();
        let store = store(&repository);
        let access = AccessControl::new(&store);

        access.grant_app_access("alice", "foo").unwrap();
        access.grant_app_access("alice", "baz").unwrap();

        assert!(access.has_access("alice", "foo").unwrap());
        assert!(access.has_access("alice", "baz").unwrap());
        assert!(!access.has_access("alice", "qux").unwrap());
    }

    #[test]
    fn registered_user_is_stored() {
        let repository = MemoryRepository::new();
        let store = store(&repository);
        let access = AccessControl::new(&store);
        let hash = bcrypt::hash("secret", TEST_COST).unwrap();

        access.register_user("bob", &hash).unwrap();

        let stored: UserRecord =
            serde_json::from_slice(&repository.file(&user_path("bob")).unwrap()).unwrap();
        assert_eq!(stored.hashed_password, hash);
        assert!(stored.apps.is_empty());
        assert!(!stored.is_admin);
        assert_eq!(repository.messages()[0], "Register user bob");
    }

    #[test]
    fn duplicate_registration_fails() {
        let repository = repository_with_alice();
        let store = store(&repository);
        let access = AccessControl::new(&store);

        assert!(matches!(
            access.register_user("alice", "hash"),
            Err(AccessError::UserExists { .. })
        ));
    }

    #[test]
    fn path_like_usernames_are_rejected() {
        let repository = repository_with_alice();
        let store = store(&repository);
        let access = AccessControl::new(&store);

        assert!(matches!(
            access.register_user("../alice", "hash"),
            Err(AccessError::InvalidUsername { .. })
        ));
        assert!(matches!(
            access.is_admin("nobody"),
            Err(AccessError::UnknownUser { .. })
        ));
    }
}
