//! # Send
//!
//! Operator CLI for a small fleet of app servers.
//!
//! All shared state (users, grants, host lists, server keys and compose files)
//! lives in a single Git repository that is accessed through the GitHub REST API,
//! so the tool needs no database of its own. Servers are created on DigitalOcean
//! and configured with the swarm CLI, while every remote interaction goes through
//! the system `ssh` and `scp` binaries.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![cfg_attr(test, allow(clippy::missing_docs_in_private_items))]

use clap::Parser;
use commands::{Cli, Commands};
use common::config::Config;
use context::Context;

/// Deployment bundle collection.
mod bundle;

/// CLI subcommands.
mod commands;

/// Compute provider client.
mod compute;

/// Shared subcommand context.
mod context;

/// Team notifications.
mod notify;

/// Server provisioning workflow.
mod provision;

/// Remote command execution over SSH.
mod remote;

/// Encrypted local session.
mod session;

/// Configuration management tool driver.
mod swarm;

/// CLI entrypoint.
fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let config = Config::new(cli.config_file)?;
    common::logging::init(&config);

    let context = Context::new(config)?;

    match cli.command {
        Commands::Login => commands::login(&context)?,
        Commands::Logout => commands::logout(&context)?,
        Commands::Signup => commands::signup(&context)?,
        Commands::Ls => commands::ls(&context)?,
        Commands::Grant(args) => commands::grant(&context, args)?,
        Commands::Pull(args) => commands::pull(&context, args)?,
        Commands::Push(args) => commands::push(&context, args)?,
        Commands::Exec(args) => commands::exec(&context, args)?,
        Commands::Provision(args) => commands::provision(&context, args)?,
        Commands::Notify(args) => commands::notify(&context, args)?,
    }

    Ok(())
}
