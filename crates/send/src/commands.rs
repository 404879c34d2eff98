/// `login`, `logout`, `signup` and `ls` subcommands.
mod account;

/// `pull` and `push` subcommands.
mod config;

/// `exec` subcommand.
mod exec;

/// `grant` subcommand.
mod grant;

/// `notify` subcommand.
mod notify;

/// `provision` subcommand.
mod provision;

pub(crate) use account::{login, logout, ls, signup};
pub(crate) use config::{pull, push};
pub(crate) use exec::exec;
pub(crate) use grant::grant;
pub(crate) use notify::notify;
pub(crate) use provision::provision;

use std::{io, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use derive_more::{Display, Error, From};
use indicatif::ProgressBar;
use inquire::InquireError;
use store::access::AccessError;

use crate::{
    compute::ComputeError, provision::ProvisionError, remote::RemoteError, session::SessionError,
    swarm::SwarmError,
};

/// Subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum CommandError {
    /// IO-related error.
    Io(io::Error),

    /// Access control error.
    Access(AccessError),

    /// Local session error.
    Session(SessionError),

    /// Remote execution error.
    Remote(RemoteError),

    /// Provisioning error.
    Provision(ProvisionError),

    /// Compute provider error.
    Compute(ComputeError),

    /// Configuration tool error.
    Swarm(SwarmError),

    /// Unable to read interactive input.
    #[display(fmt = "unable to read input: {}", _0)]
    Prompt(InquireError),

    /// Unable to locate a required binary.
    #[display(fmt = "unable to locate a required binary: {}", _0)]
    Which(which::Error),

    /// Interactive input was left empty.
    #[from(ignore)]
    #[display(fmt = "{} cannot be empty", field)]
    EmptyInput {
        /// Name of the empty field.
        field: &'static str,
    },

    /// Unknown username or wrong password.
    #[display(fmt = "username doesn't exist or password is incorrect")]
    InvalidCredentials,

    /// Operation requires an administrator.
    #[display(fmt = "you do not have admin access")]
    NotAdmin,

    /// Operator was not granted access to the app.
    #[from(ignore)]
    #[display(fmt = "you don't have access to {}", app)]
    AccessDenied {
        /// App name.
        app: String,
    },

    /// Provisioning requires the `compute` configuration section.
    #[display(fmt = "compute provider is not configured")]
    ComputeNotConfigured,

    /// Remote command exited with a non-zero status.
    #[display(fmt = "remote command exited with an error")]
    RemoteCommandFailed,
}

/// Create a spinner with the provided initial message.
pub(crate) fn spinner(message: &'static str) -> ProgressBar {
    let progress = ProgressBar::new_spinner();

    progress.enable_steady_tick(Duration::from_millis(150));
    progress.set_message(message);

    progress
}

/// CLI configuration.
#[derive(Parser)]
#[command(about, version)]
pub(crate) struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "Send.toml")]
    pub config_file: Option<PathBuf>,

    /// Selected subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

/// Supported subcommands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Log in to an account.
    Login,

    /// Log out of the current account.
    Logout,

    /// Create an account.
    Signup,

    /// List the apps the current account has access to.
    Ls,

    /// Grant a user access to an app.
    #[command(alias = "add")]
    Grant(Grant),

    /// Download the compose files of an app.
    Pull(Pull),

    /// Upload a compose file of an app, creating or updating it.
    Push(Push),

    /// Run a command on an app's server.
    Exec(Exec),

    /// Create a new server for an app and configure it with the swarm CLI.
    Provision(Provision),

    /// Post a message to the team webhook.
    Notify(Notify),
}

/// `grant` subcommand configuration.
#[derive(Args)]
pub struct Grant {
    /// User to grant access to.
    username: String,

    /// App name.
    app: String,
}

/// `pull` subcommand configuration.
#[derive(Args)]
pub struct Pull {
    /// App name.
    app: String,

    /// Directory where the `<app>` directory with compose files is created.
    #[arg(short, long, default_value = ".")]
    destination: PathBuf,
}

/// `push` subcommand configuration.
#[derive(Args)]
pub struct Push {
    /// App name.
    app: String,

    /// Compose file to upload.
    file: PathBuf,
}

/// `exec` subcommand configuration.
#[derive(Args)]
#[clap(trailing_var_arg = true)]
pub struct Exec {
    /// App name.
    app: String,

    /// Command to run, usually a docker command.
    #[clap(required = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// `provision` subcommand configuration.
#[derive(Args)]
pub struct Provision {
    /// App name.
    app: String,

    /// Instance size slug, defaults to the configured one.
    #[arg(short, long)]
    size: Option<String>,
}

/// `notify` subcommand configuration.
#[derive(Args)]
pub struct Notify {
    /// Message text.
    message: String,
}
