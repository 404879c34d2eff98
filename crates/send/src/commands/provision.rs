use crate::{
    commands::{spinner, CommandError, Provision},
    compute::DigitalOcean,
    context::Context,
    provision::{ProvisionSettings, Provisioner, ReportLeftovers, SshKeygen, ThreadSleeper},
    swarm::SwarmCli,
};

/// Provisioning flow entrypoint.
pub(crate) fn provision(
    context: &Context,
    Provision { app, size }: Provision,
) -> Result<(), CommandError> {
    let username = context.require_admin()?;

    let compute_config = context
        .config
        .compute
        .as_ref()
        .ok_or(CommandError::ComputeNotConfigured)?;

    let size = size.unwrap_or_else(|| compute_config.default_size.clone());

    let compute = DigitalOcean::new(compute_config)?;
    let keys = SshKeygen::new()?;
    let tool = SwarmCli::new(&context.state_dir, &context.config.swarm)?;

    let provisioner = Provisioner {
        store: &context.store,
        compute: &compute,
        keys: &keys,
        tool: &tool,
        sleeper: &ThreadSleeper,
        hook: &ReportLeftovers,
        settings: ProvisionSettings::new(context.state_dir.clone(), compute_config),
    };

    let progress = spinner("Provisioning...");

    let report = match provisioner.provision(&username, &app, &size, &progress) {
        Ok(report) => report,
        Err(error) => {
            progress.finish_with_message("Provisioning failed.");
            return Err(error.into());
        }
    };

    progress.finish_with_message(format!(
        "Provisioned instance {} for {app} at {}, bundle committed as {}",
        report.instance, report.address, report.commit
    ));
    context
        .notifier
        .notify(&format!("User {username} provisioned a new server for {app}."));

    Ok(())
}
