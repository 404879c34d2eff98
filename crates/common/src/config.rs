use std::path::PathBuf;

use derive_more::{Display, Error};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

#[cfg(feature = "logging")]
use tracing_subscriber::filter::LevelFilter;

/// Backing repository configuration.
///
/// The repository is accessed through a GitHub App installation, thus
/// requiring both the application identifier and its RSA signing key.
#[derive(Deserialize)]
pub struct Repository {
    /// Base URL of the GitHub-compatible REST API.
    #[serde(default = "default_repository_api_url")]
    pub api_url: String,

    /// Repository owner (user or organization).
    #[serde(default = "default_repository_owner")]
    pub owner: String,

    /// Repository name.
    #[serde(default = "default_repository_name")]
    pub name: String,

    /// Branch used as the record store.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// GitHub App identifier, used as the assertion issuer.
    pub app_id: String,

    /// GitHub App installation identifier.
    #[serde(default = "default_installation_id")]
    pub installation_id: u64,

    /// Path to the PEM-encoded RSA private key of the GitHub App.
    pub private_key_path: PathBuf,
}

/// Compute provider configuration.
#[derive(Deserialize)]
pub struct Compute {
    /// Base URL of the DigitalOcean API.
    #[serde(default = "default_compute_api_url")]
    pub api_url: String,

    /// Personal access token.
    pub access_token: String,

    /// Region in which new instances are created.
    #[serde(default = "default_region")]
    pub region: String,

    /// Image slug used for new instances.
    #[serde(default = "default_image")]
    pub image: String,

    /// Instance size used when none is requested explicitly.
    #[serde(default = "default_size")]
    pub default_size: String,

    /// Delay between instance status checks, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Max count of instance status checks before giving up.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Delay between committing a bundle and configuring the instance, in seconds.
    #[serde(default = "default_post_init_wait")]
    pub post_init_wait: u64,
}

/// Configuration management tool (swarm CLI) settings.
#[derive(Deserialize)]
pub struct Swarm {
    /// Git repository the tool is cloned from.
    #[serde(default = "default_swarm_repository")]
    pub repository: String,
}

impl Default for Swarm {
    fn default() -> Self {
        Self {
            repository: default_swarm_repository(),
        }
    }
}

/// Webhook notifications configuration.
#[derive(Default, Deserialize)]
pub struct Notifications {
    /// Incoming webhook URL. Notifications are skipped if not set.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Local session configuration.
#[derive(Deserialize)]
pub struct Session {
    /// Symmetric key used to encrypt the current username, exactly 32 bytes long.
    pub encryption_key: String,
}

/// Remote shell configuration.
#[derive(Deserialize)]
pub struct Remote {
    /// User name used to connect to app hosts.
    #[serde(default = "default_remote_user")]
    pub user: String,
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            user: default_remote_user(),
        }
    }
}

/// Implementation of [`serde`]'s deserializer for [`FromStr`] types.
#[cfg(feature = "logging")]
fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error,
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    std::str::FromStr::from_str(&s).map_err(serde::de::Error::custom)
}

/// Logging configuration.
#[cfg(feature = "logging")]
#[derive(Deserialize)]
pub struct Logging {
    /// Log level.
    #[serde(deserialize_with = "deserialize_from_str")]
    pub level: LevelFilter,
}

#[cfg(feature = "logging")]
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
        }
    }
}

// Default values reflect the hosted deployment this tool was written for.
fn default_repository_api_url() -> String {
    String::from("https://github.coecis.cornell.edu/api/v3")
}

fn default_repository_owner() -> String {
    String::from("cuappdev")
}

fn default_repository_name() -> String {
    String::from("send-devops")
}

fn default_branch() -> String {
    String::from("master")
}

fn default_installation_id() -> u64 {
    1
}

fn default_compute_api_url() -> String {
    String::from("https://api.digitalocean.com/v2")
}

fn default_region() -> String {
    String::from("nyc3")
}

fn default_image() -> String {
    String::from("ubuntu-18-04-x64")
}

fn default_size() -> String {
    String::from("s-1vcpu-1gb")
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_poll_attempts() -> u32 {
    120
}

fn default_post_init_wait() -> u64 {
    30
}

fn default_swarm_repository() -> String {
    String::from("https://github.com/cuappdev/swarm-cli.git")
}

fn default_remote_user() -> String {
    String::from("appdev")
}

/// Local state directory errors.
#[derive(Debug, Display, Error)]
pub enum ConfigError {
    /// User's home directory cannot be determined.
    #[display(fmt = "unable to find home directory")]
    HomeDirNotFound,
}

/// General configuration.
#[derive(Deserialize)]
pub struct Config {
    /// Backing repository configuration.
    pub repository: Repository,

    /// Compute provider configuration, required only for provisioning.
    #[serde(default)]
    pub compute: Option<Compute>,

    /// Configuration management tool settings.
    #[serde(default)]
    pub swarm: Swarm,

    /// Webhook notifications configuration.
    #[serde(default)]
    pub notifications: Notifications,

    /// Local session configuration.
    pub session: Session,

    /// Remote shell configuration.
    #[serde(default)]
    pub remote: Remote,

    /// Logging configuration.
    #[cfg(feature = "logging")]
    #[serde(default)]
    pub logging: Logging,

    /// Directory that holds the cached token, current session and app working directories.
    ///
    /// Defaults to `~/.send`.
    #[serde(default)]
    state_dir: Option<PathBuf>,
}

impl Config {
    /// Create new config using default configuration file or environment variables.
    ///
    /// Nested keys are separated with a double underscore,
    /// for example `SEND_REPOSITORY__APP_ID`.
    ///
    /// See [`Env`] for more details on how to use environment variables configuration.
    ///
    /// [`Env`]: figment::providers::Env
    pub fn new(path: Option<PathBuf>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.unwrap_or(PathBuf::from("Send.toml"))))
            .merge(Env::prefixed("SEND_").split("__"))
            .extract()
    }

    /// Get the local state directory.
    ///
    /// Returns [`Err`] if no directory was configured and home directory cannot be determined.
    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.state_dir {
            return Ok(path.clone());
        }

        let mut home_dir = home::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
        home_dir.push(".send");
        Ok(home_dir)
    }

    /// Create new config suitable for running unit tests.
    #[cfg(feature = "test-utils")]
    pub fn for_tests(state_dir: PathBuf) -> Self {
        Self {
            repository: Repository {
                api_url: String::from("http://127.0.0.1:9"),
                owner: default_repository_owner(),
                name: default_repository_name(),
                branch: default_branch(),
                app_id: String::from("1"),
                installation_id: default_installation_id(),
                private_key_path: state_dir.join("app.pem"),
            },
            compute: Some(Compute {
                api_url: String::from("http://127.0.0.1:9"),
                access_token: String::new(),
                region: default_region(),
                image: default_image(),
                default_size: default_size(),
                poll_interval: 0,
                max_poll_attempts: 10,
                post_init_wait: 0,
            }),
            swarm: Swarm::default(),
            notifications: Notifications::default(),
            session: Session {
                encryption_key: String::from("0123456789abcdef0123456789abcdef"),
            },
            remote: Remote::default(),
            #[cfg(feature = "logging")]
            logging: Logging::default(),
            state_dir: Some(state_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use figment::Jail;

    use super::Config;

    #[test]
    fn defaults_are_applied() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "Send.toml",
                r#"
                state_dir = "/tmp/send-state"

                [repository]
                app_id = "42"
                private_key_path = "/keys/app.pem"

                [compute]
                access_token = "do-token"

                [session]
                encryption_key = "0123456789abcdef0123456789abcdef"
                "#,
            )?;

            let config = Config::new(None)?;

            assert_eq!(config.repository.app_id, "42");
            assert_eq!(config.repository.branch, "master");
            assert_eq!(config.repository.installation_id, 1);
            let compute = config.compute.as_ref().unwrap();
            assert_eq!(compute.region, "nyc3");
            assert_eq!(compute.poll_interval, 5);
            assert_eq!(compute.post_init_wait, 30);
            assert_eq!(config.remote.user, "appdev");
            assert!(config.notifications.webhook_url.is_none());
            assert_eq!(
                config.state_dir().unwrap(),
                PathBuf::from("/tmp/send-state")
            );

            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "Send.toml",
                r#"
                [repository]
                app_id = "42"
                private_key_path = "/keys/app.pem"

                [compute]
                access_token = "do-token"

                [session]
                encryption_key = "0123456789abcdef0123456789abcdef"
                "#,
            )?;
            jail.set_env("SEND_REPOSITORY__BRANCH", "main");
            jail.set_env("SEND_NOTIFICATIONS__WEBHOOK_URL", "https://hooks.example/x");

            let config = Config::new(None)?;

            assert_eq!(config.repository.branch, "main");
            assert_eq!(
                config.notifications.webhook_url.as_deref(),
                Some("https://hooks.example/x")
            );

            Ok(())
        });
    }
}
