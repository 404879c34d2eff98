//! # Configuration tool
//!
//! New servers are configured with the swarm CLI, an Ansible-based tool that
//! is cloned into the local state directory and bootstrapped inside a Python
//! virtual environment on first use.

use std::{
    fmt, fs,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use common::config;
use derive_more::{Display, Error, From};
use indicatif::ProgressBar;
use tracing::info;

/// Directory name of the tool inside the local state directory.
const TOOL_DIR: &str = "swarm-cli";

/// File produced by the last bootstrap command.
const BOOTSTRAP_MARKER: &str = "swarm.ini";

/// Commands that prepare a fresh clone for use.
const BOOTSTRAP_COMMANDS: [&str; 5] = [
    "virtualenv venv",
    ". venv/bin/activate",
    "pip install -r requirements.txt",
    "ansible-galaxy install --roles-path roles -r requirements.yml",
    "cp swarm.ini.in swarm.ini",
];

/// Configuration tool errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum SwarmError {
    /// IO-related error.
    Io(io::Error),

    /// Unable to locate a required binary.
    #[display(fmt = "unable to locate git: {}", _0)]
    Which(which::Error),

    /// Unable to clone the tool repository.
    #[from(ignore)]
    #[display(fmt = "unable to clone {}", repository)]
    Clone {
        /// Repository that failed to clone.
        repository: String,
    },

    /// Unable to install the tool dependencies.
    #[display(fmt = "unable to set up the swarm CLI dependencies")]
    Bootstrap,

    /// Configuration step failed.
    #[from(ignore)]
    #[display(fmt = "swarm command `{}` failed", step)]
    Step {
        /// Name of the failed step.
        step: String,
    },
}

/// A single configuration step, run in order against a freshly committed bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConfigureStep {
    /// Compile the bundle located in the provided directory.
    Compile(PathBuf),

    /// Restrict access to the new server.
    Lockdown,

    /// Join the server into a swarm.
    Join,

    /// Deploy the configured services.
    Configure,
}

impl ConfigureStep {
    /// Get the full sequence for a bundle directory.
    pub fn sequence(bundle: &Path) -> [ConfigureStep; 4] {
        [
            ConfigureStep::Compile(bundle.to_owned()),
            ConfigureStep::Lockdown,
            ConfigureStep::Join,
            ConfigureStep::Configure,
        ]
    }
}

impl fmt::Display for ConfigureStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigureStep::Compile(bundle) => {
                write!(f, "python manage.py compile {}", quote(&bundle.to_string_lossy()))
            }
            ConfigureStep::Lockdown => write!(f, "python manage.py swarm lockdown"),
            ConfigureStep::Join => write!(f, "python manage.py swarm join"),
            ConfigureStep::Configure => write!(f, "python manage.py swarm configure"),
        }
    }
}

/// Quote a value for use as a single POSIX shell word.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Configuration management tool.
pub(crate) trait ConfigurationTool {
    /// Make sure the tool is installed.
    fn prepare(&self, progress: &ProgressBar) -> Result<(), SwarmError>;

    /// Run a single configuration step, streaming its output.
    fn run(&self, step: &ConfigureStep, progress: &ProgressBar) -> Result<(), SwarmError>;
}

/// Swarm CLI installed in the local state directory.
pub(crate) struct SwarmCli {
    /// Tool checkout directory.
    directory: PathBuf,

    /// Repository to clone the tool from.
    repository: String,

    /// Path to the `git` binary.
    git: PathBuf,
}

impl SwarmCli {
    /// Locate `git` and resolve the tool checkout directory.
    pub fn new(state_dir: &Path, config: &config::Swarm) -> Result<Self, SwarmError> {
        Ok(Self {
            directory: state_dir.join(TOOL_DIR),
            repository: config.repository.clone(),
            git: which::which("git")?,
        })
    }

    /// Run a shell script inside the tool directory, printing its combined output.
    fn run_script(&self, script: &str, progress: &ProgressBar) -> Result<bool, SwarmError> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(format!("exec 2>&1; {script}"))
            .current_dir(&self.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                progress.println(line?);
            }
        }

        Ok(child.wait()?.success())
    }
}

impl ConfigurationTool for SwarmCli {
    fn prepare(&self, progress: &ProgressBar) -> Result<(), SwarmError> {
        if self.directory.join(BOOTSTRAP_MARKER).exists() {
            return Ok(());
        }

        // A checkout without the marker is a leftover of an interrupted bootstrap.
        if self.directory.exists() {
            fs::remove_dir_all(&self.directory)?;
        }

        progress.set_message("Setting up swarm CLI...");
        info!(repository = %self.repository, "cloning swarm CLI");

        let clone = Command::new(&self.git)
            .arg("clone")
            .arg(&self.repository)
            .arg(&self.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?
            .wait()?;

        if !clone.success() {
            return Err(SwarmError::Clone {
                repository: self.repository.clone(),
            });
        }

        if !self.run_script(&BOOTSTRAP_COMMANDS.join(" && "), progress)? {
            return Err(SwarmError::Bootstrap);
        }

        Ok(())
    }

    fn run(&self, step: &ConfigureStep, progress: &ProgressBar) -> Result<(), SwarmError> {
        let command = step.to_string();

        progress.set_message(format!("Running {command}..."));
        info!(%command, "running swarm command");

        if !self.run_script(&format!(". venv/bin/activate && {command}"), progress)? {
            return Err(SwarmError::Step { step: command });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{quote, ConfigureStep};

    #[test]
    fn steps_run_in_order() {
        let commands: Vec<_> = ConfigureStep::sequence(Path::new("/home/op/.send/blog"))
            .iter()
            .map(ToString::to_string)
            .collect();

        assert_eq!(
            commands,
            vec![
                "python manage.py compile '/home/op/.send/blog'",
                "python manage.py swarm lockdown",
                "python manage.py swarm join",
                "python manage.py swarm configure",
            ]
        );
    }

    #[test]
    fn quotes_are_escaped() {
        assert_eq!(quote("it's"), r"'it'\''s'");
    }
}
