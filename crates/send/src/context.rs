use std::path::PathBuf;

use common::config::{Config, ConfigError};
use derive_more::{Display, Error, From};
use store::{
    access::AccessControl,
    credentials::{CredentialCache, InstallationTokenExchange},
    github::GitHubClient,
    records::RecordStore,
};

use crate::{
    commands::CommandError,
    notify::Notifier,
    session::{Session, SessionError},
};

/// Command context initialization errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ContextError {
    /// Invalid configuration.
    Config(ConfigError),

    /// Unable to open the local session.
    Session(SessionError),
}

/// Shared state of every subcommand.
pub(crate) struct Context {
    /// Loaded configuration.
    pub config: Config,

    /// Local state directory.
    pub state_dir: PathBuf,

    /// Repository-backed record store.
    pub store: RecordStore,

    /// Local session of the current operator.
    pub session: Session,

    /// Team notifications.
    pub notifier: Notifier,
}

impl Context {
    /// Build every client from the loaded configuration.
    pub fn new(config: Config) -> Result<Self, ContextError> {
        let state_dir = config.state_dir()?;

        let credentials = CredentialCache::new(
            &state_dir,
            Box::new(InstallationTokenExchange::new(&config)),
        );
        let store = RecordStore::new(Box::new(GitHubClient::new(&config, credentials)));
        let session = Session::new(&state_dir, &config.session.encryption_key)?;
        let notifier = Notifier::new(&config.notifications);

        Ok(Self {
            config,
            state_dir,
            store,
            session,
            notifier,
        })
    }

    /// Get the current operator, failing if nobody is logged in.
    pub fn current_user(&self) -> Result<String, CommandError> {
        Ok(self.session.require()?)
    }

    /// Get the current operator, failing unless they have access to `app`.
    pub fn require_access(&self, app: &str) -> Result<String, CommandError> {
        let username = self.current_user()?;

        if !AccessControl::new(&self.store).has_access(&username, app)? {
            return Err(CommandError::AccessDenied {
                app: app.to_owned(),
            });
        }

        Ok(username)
    }

    /// Get the current operator, failing unless they are an administrator.
    pub fn require_admin(&self) -> Result<String, CommandError> {
        let username = self.current_user()?;

        if !AccessControl::new(&self.store).is_admin(&username)? {
            return Err(CommandError::NotAdmin);
        }

        Ok(username)
    }
}

#[cfg(test)]
mod tests {
    use common::config::Config;
    use tempfile::TempDir;

    use super::Context;
    use crate::{commands::CommandError, session::SessionError};

    #[test]
    fn commands_require_login() {
        let dir = TempDir::new().unwrap();
        let context = Context::new(Config::for_tests(dir.path().to_path_buf())).unwrap();

        assert!(matches!(
            context.require_access("blog"),
            Err(CommandError::Session(SessionError::LoginRequired))
        ));
        assert!(matches!(
            context.require_admin(),
            Err(CommandError::Session(SessionError::LoginRequired))
        ));
    }

    #[test]
    fn session_is_kept_in_state_directory() {
        let dir = TempDir::new().unwrap();
        let context = Context::new(Config::for_tests(dir.path().to_path_buf())).unwrap();

        context.session.write("alice").unwrap();

        assert_eq!(context.current_user().unwrap(), "alice");
        assert!(dir.path().join("user").exists());
    }
}
