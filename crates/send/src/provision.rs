//! # Provisioning
//!
//! Provisioning a server for a new app is a linear sequence of [`Stage`]s:
//!
//! 1. The app name is validated, and the app namespace must not exist in the repository.
//! 2. A key pair is generated inside the app's local working directory.
//! 3. The public key is registered with the compute provider and an instance is requested.
//! 4. The instance is polled until it is active and has a public address.
//! 5. The starter files are downloaded, and a host list with the new address is written.
//! 6. The whole working directory is published as a single commit.
//! 7. After a short delay the configuration tool is run against the new bundle.
//! 8. The invoking user is granted access to the app.
//!
//! A failure at any stage aborts the remaining ones. Nothing is rolled back: the
//! [`FailureHook`] is told which stage failed and what was created so far.
//!
//! The namespace check runs right before the first side effect, yet two operators
//! provisioning the same name concurrently may both pass it. The bundle commit
//! itself is rejected if the branch moved in the meantime.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use common::config;
use derive_more::{Display, Error, From};
use indicatif::ProgressBar;
use store::{
    access::{AccessControl, AccessError},
    records::{RecordStore, StoreError},
};
use tracing::{info, warn};

use crate::{
    bundle::{collect_bundle, BundleError},
    compute::{ComputeError, ComputeProvider, InstanceRequest, InstanceStatus},
    swarm::{ConfigurationTool, ConfigureStep, SwarmError},
};

/// Name of the private key file inside the app working directory.
const PRIVATE_KEY_FILE: &str = "server.pem";

/// Name of the public key file inside the app working directory.
const PUBLIC_KEY_FILE: &str = "server.pem.pub";

/// Repository directory with files every new app starts with.
const STARTER_DIR: &str = "starter";

/// Subdirectory holding compose files.
const COMPOSE_DIR: &str = "docker-compose";

/// Top-level repository directories that cannot be used as app names.
const RESERVED_NAMES: [&str; 2] = ["users", STARTER_DIR];

/// Provisioning errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ProvisionError {
    /// IO-related error.
    Io(io::Error),

    /// Record store error.
    Store(StoreError),

    /// Access control error.
    Access(AccessError),

    /// Compute provider error.
    Compute(ComputeError),

    /// Configuration tool error.
    Swarm(SwarmError),

    /// Bundle collection error.
    Bundle(BundleError),

    /// App name cannot be used as a repository directory.
    #[from(ignore)]
    #[display(fmt = "invalid app name {:?}", app)]
    InvalidName {
        /// App name.
        app: String,
    },

    /// App already exists in the repository.
    #[from(ignore)]
    #[display(fmt = "app {} already exists, choose a different name", app)]
    AppExists {
        /// App name.
        app: String,
    },

    /// Requested instance size is not offered by the provider.
    #[from(ignore)]
    #[display(fmt = "instance size {} is not available", size)]
    InvalidSize {
        /// Requested size slug.
        size: String,
    },

    /// Local working directory contains leftovers of a previous attempt.
    #[from(ignore)]
    #[display(fmt = "working directory {} is not empty, remove it first", path)]
    StaleWorkingDirectory {
        /// Working directory path.
        path: String,
    },

    /// Key pair generation failed.
    #[display(fmt = "unable to generate server keys")]
    KeyGeneration,

    /// Instance reported an error status.
    #[from(ignore)]
    #[display(fmt = "instance {} failed to start", id)]
    InstanceFailed {
        /// Instance identifier.
        id: u64,
    },

    /// Instance did not become ready in time.
    #[from(ignore)]
    #[display(fmt = "instance {} was not ready after {} status checks", id, attempts)]
    NotReady {
        /// Instance identifier.
        id: u64,

        /// Count of status checks made.
        attempts: u32,
    },
}

/// Provisioning stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stage {
    /// App name and size validation.
    ValidateName,
    /// Server key pair generation.
    GenerateKeypair,
    /// Instance creation.
    CreateInstance,
    /// Waiting for the instance to become active.
    AwaitReady,
    /// Local bundle assembly.
    AssembleBundle,
    /// Bundle publication.
    CommitBundle,
    /// Waiting for the instance to finish its boot.
    PostInitWait,
    /// Remote configuration run.
    RemoteConfigure,
    /// Access grant registration.
    RegisterAccess,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ValidateName => "validate-name",
            Stage::GenerateKeypair => "generate-keypair",
            Stage::CreateInstance => "create-instance",
            Stage::AwaitReady => "await-ready",
            Stage::AssembleBundle => "assemble-bundle",
            Stage::CommitBundle => "commit-bundle",
            Stage::PostInitWait => "post-init-wait",
            Stage::RemoteConfigure => "remote-configure",
            Stage::RegisterAccess => "register-access",
        };

        f.write_str(name)
    }
}

/// Resources created by a provisioning run so far.
#[derive(Debug)]
pub(crate) struct ProvisionState {
    /// Stage being executed.
    pub stage: Stage,

    /// Local working directory of the app.
    pub working_dir: PathBuf,

    /// Requested instance.
    pub instance: Option<u64>,

    /// Public address of the instance.
    pub address: Option<String>,

    /// Published bundle commit.
    pub commit: Option<String>,
}

impl ProvisionState {
    /// Initial state of a run assembling into `working_dir`.
    fn new(working_dir: PathBuf) -> Self {
        Self {
            stage: Stage::ValidateName,
            working_dir,
            instance: None,
            address: None,
            commit: None,
        }
    }
}

/// Summary of a successful provisioning run.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ProvisionReport {
    /// Instance identifier.
    pub instance: u64,

    /// Public address of the instance.
    pub address: String,

    /// Published bundle commit.
    pub commit: String,
}

/// Called once when a provisioning run fails.
pub(crate) trait FailureHook {
    /// Inspect the error and the state reached by the failed run.
    fn on_failure(&self, error: &ProvisionError, state: &ProvisionState);
}

/// [`FailureHook`] that reports created resources that need manual cleanup.
pub(crate) struct ReportLeftovers;

impl FailureHook for ReportLeftovers {
    fn on_failure(&self, error: &ProvisionError, state: &ProvisionState) {
        warn!(stage = %state.stage, %error, "provisioning failed");

        if let Some(id) = state.instance {
            warn!(id, "instance was created and is left running");

            if state.commit.is_none() {
                warn!(id, "private key of the instance was not published, destroy it manually");
            }
        }

        if let Some(commit) = &state.commit {
            warn!(%commit, "bundle was published to the repository");
        }
    }
}

/// Blocking delay source.
pub(crate) trait Sleeper {
    /// Block the current thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by [`thread::sleep`].
pub(crate) struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// SSH key pair generator.
pub(crate) trait KeyGenerator {
    /// Generate `<directory>/<name>` private key and `<directory>/<name>.pub` public key.
    fn generate(&self, directory: &Path, name: &str) -> Result<(), ProvisionError>;
}

/// [`KeyGenerator`] that uses `ssh-keygen`.
pub(crate) struct SshKeygen {
    /// Path to the `ssh-keygen` binary.
    binary: PathBuf,
}

impl SshKeygen {
    /// Locate `ssh-keygen` in `PATH`.
    pub fn new() -> Result<Self, which::Error> {
        Ok(Self {
            binary: which::which("ssh-keygen")?,
        })
    }
}

impl KeyGenerator for SshKeygen {
    fn generate(&self, directory: &Path, name: &str) -> Result<(), ProvisionError> {
        let status = Command::new(&self.binary)
            .args(["-q", "-t", "rsa", "-b", "4096", "-N", "", "-f", name])
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?
            .wait()?;

        if !status.success() {
            return Err(ProvisionError::KeyGeneration);
        }

        Ok(())
    }
}

/// Timing and placement settings of a provisioning run.
pub(crate) struct ProvisionSettings {
    /// Local state directory; apps are assembled inside `<state_dir>/<app>`.
    pub state_dir: PathBuf,

    /// Region slug.
    pub region: String,

    /// Image slug.
    pub image: String,

    /// Delay between instance status checks.
    pub poll_interval: Duration,

    /// Max count of instance status checks.
    pub max_poll_attempts: u32,

    /// Delay between the bundle commit and the configuration run.
    pub post_init_wait: Duration,
}

impl ProvisionSettings {
    /// Settings of a run assembling apps inside `state_dir`.
    pub fn new(state_dir: PathBuf, config: &config::Compute) -> Self {
        Self {
            state_dir,
            region: config.region.clone(),
            image: config.image.clone(),
            poll_interval: Duration::from_secs(config.poll_interval),
            max_poll_attempts: config.max_poll_attempts,
            post_init_wait: Duration::from_secs(config.post_init_wait),
        }
    }
}

/// Removes the local private key when the run ends, successfully or not.
struct LocalKeyGuard<'a> {
    /// Private key path.
    path: &'a Path,
}

impl Drop for LocalKeyGuard<'_> {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(self.path) {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %error, "unable to remove local private key");
            }
        }
    }
}

/// Check that an app name is usable as a single repository path segment.
fn validate_app_name(app: &str) -> Result<(), ProvisionError> {
    let valid = !app.is_empty()
        && app
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !app.starts_with('-')
        && !RESERVED_NAMES.contains(&app);

    if valid {
        Ok(())
    } else {
        Err(ProvisionError::InvalidName {
            app: app.to_owned(),
        })
    }
}

/// Host list with a single manager node.
fn hosts_file(address: &str) -> String {
    format!("[manager]\n{address}\n")
}

/// Server provisioning workflow.
pub(crate) struct Provisioner<'a> {
    /// Repository record store.
    pub store: &'a RecordStore,
    /// Cloud provider.
    pub compute: &'a dyn ComputeProvider,
    /// Server key pair generator.
    pub keys: &'a dyn KeyGenerator,
    /// Remote configuration tool.
    pub tool: &'a dyn ConfigurationTool,
    /// Delay source.
    pub sleeper: &'a dyn Sleeper,
    /// Called when the run fails.
    pub hook: &'a dyn FailureHook,
    /// Run settings.
    pub settings: ProvisionSettings,
}

impl Provisioner<'_> {
    /// Provision a server for `app` with the provided instance `size`,
    /// granting `username` access to it.
    pub fn provision(
        &self,
        username: &str,
        app: &str,
        size: &str,
        progress: &ProgressBar,
    ) -> Result<ProvisionReport, ProvisionError> {
        let mut state = ProvisionState::new(self.settings.state_dir.join(app));

        let result = self.run(username, app, size, progress, &mut state);

        if let Err(error) = &result {
            self.hook.on_failure(error, &state);
        }

        result
    }

    /// Record the stage and show its message.
    fn enter(&self, state: &mut ProvisionState, stage: Stage, progress: &ProgressBar, message: &str) {
        info!(%stage, "entering provisioning stage");
        state.stage = stage;
        progress.set_message(message.to_owned());
    }

    /// Run every stage, updating `state` as resources get created.
    fn run(
        &self,
        username: &str,
        app: &str,
        size: &str,
        progress: &ProgressBar,
        state: &mut ProvisionState,
    ) -> Result<ProvisionReport, ProvisionError> {
        let working_dir = state.working_dir.clone();

        self.enter(state, Stage::ValidateName, progress, "Validating app name...");
        self.validate(app, size, &working_dir)?;

        self.enter(state, Stage::GenerateKeypair, progress, "Generating server keys...");
        fs::create_dir_all(&working_dir)?;
        let private_key = working_dir.join(PRIVATE_KEY_FILE);
        let _key_guard = LocalKeyGuard {
            path: &private_key,
        };
        self.keys.generate(&working_dir, PRIVATE_KEY_FILE)?;

        self.enter(state, Stage::CreateInstance, progress, "Creating instance...");
        let public_key = fs::read_to_string(working_dir.join(PUBLIC_KEY_FILE))?;
        let fingerprint = self.compute.register_key(app, public_key.trim())?;
        let id = self.compute.create_instance(&InstanceRequest {
            name: app,
            region: &self.settings.region,
            size,
            image: &self.settings.image,
            ssh_keys: vec![fingerprint.as_str()],
        })?;
        state.instance = Some(id);

        self.enter(state, Stage::AwaitReady, progress, "Waiting for an IP address...");
        let address = self.await_ready(id)?;
        state.address = Some(address.clone());

        self.enter(state, Stage::AssembleBundle, progress, "Assembling app bundle...");
        self.assemble_bundle(&working_dir, &address)?;

        self.enter(state, Stage::CommitBundle, progress, "Publishing app bundle...");
        let files = collect_bundle(app, &working_dir, progress)?;
        let commit = self.store.create_commit(
            &files,
            &format!("Add deployment bundle for new app: {app}"),
        )?;
        state.commit = Some(commit.clone());

        self.enter(state, Stage::PostInitWait, progress, "Waiting for instance initialization...");
        self.sleeper.sleep(self.settings.post_init_wait);

        self.enter(state, Stage::RemoteConfigure, progress, "Configuring instance...");
        self.tool.prepare(progress)?;
        for step in ConfigureStep::sequence(&working_dir) {
            self.tool.run(&step, progress)?;
        }

        self.enter(state, Stage::RegisterAccess, progress, "Granting access...");
        AccessControl::new(self.store).grant_app_access(username, app)?;

        info!(app, id, %address, %commit, "server provisioned");

        Ok(ProvisionReport {
            instance: id,
            address,
            commit,
        })
    }

    /// Check the app name, the working directory and the size slug.
    fn validate(&self, app: &str, size: &str, working_dir: &Path) -> Result<(), ProvisionError> {
        validate_app_name(app)?;

        if !self.compute.sizes()?.iter().any(|available| available == size) {
            return Err(ProvisionError::InvalidSize {
                size: size.to_owned(),
            });
        }

        if working_dir.exists() && fs::read_dir(working_dir)?.next().is_some() {
            return Err(ProvisionError::StaleWorkingDirectory {
                path: working_dir.display().to_string(),
            });
        }

        if self.store.exists(app)? {
            return Err(ProvisionError::AppExists {
                app: app.to_owned(),
            });
        }

        Ok(())
    }

    /// Poll the instance until it is active, returning its public address.
    fn await_ready(&self, id: u64) -> Result<String, ProvisionError> {
        let attempts = self.settings.max_poll_attempts;

        for attempt in 1..=attempts {
            let instance = self.compute.instance(id)?;

            match (instance.status, instance.public_address) {
                (InstanceStatus::Active, Some(address)) => return Ok(address),
                (InstanceStatus::Error, _) => return Err(ProvisionError::InstanceFailed { id }),
                (status, _) => {
                    info!(id, ?status, attempt, "instance is not ready yet");

                    if attempt < attempts {
                        self.sleeper.sleep(self.settings.poll_interval);
                    }
                }
            }
        }

        Err(ProvisionError::NotReady { id, attempts })
    }

    /// Write the host list and the compose templates into `working_dir`.
    fn assemble_bundle(&self, working_dir: &Path, address: &str) -> Result<(), ProvisionError> {
        self.store.download_directory(STARTER_DIR, working_dir)?;

        let compose_dir = working_dir.join(COMPOSE_DIR);

        match self
            .store
            .download_directory(&format!("{STARTER_DIR}/{COMPOSE_DIR}"), &compose_dir)
        {
            Ok(_) => {}
            Err(StoreError::NotFound { .. }) => fs::create_dir_all(&compose_dir)?,
            Err(error) => return Err(error.into()),
        }

        fs::write(working_dir.join("hosts"), hosts_file(address))?;

        Ok(())
    }
}
