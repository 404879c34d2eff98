use crate::{
    commands::{CommandError, Exec},
    context::Context,
    remote::{OpenSsh, RemoteBridge},
};

/// Remote command flow entrypoint.
pub(crate) fn exec(context: &Context, Exec { app, command }: Exec) -> Result<(), CommandError> {
    context.require_access(&app)?;

    let shell = OpenSsh::new()?;
    let bridge = RemoteBridge::new(
        &context.store,
        &shell,
        context.state_dir.clone(),
        context.config.remote.user.clone(),
    );

    let output = bridge.run_remote(&app, &command.join(" "))?;

    print!("{}", output.output);

    if !output.success {
        return Err(CommandError::RemoteCommandFailed);
    }

    Ok(())
}
