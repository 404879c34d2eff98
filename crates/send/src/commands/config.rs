use crate::{
    commands::{spinner, CommandError, Pull, Push},
    context::Context,
    remote::{pull_config, OpenSsh, PushOutcome, RemoteBridge},
};

/// Download the compose files of an app.
pub(crate) fn pull(context: &Context, Pull { app, destination }: Pull) -> Result<(), CommandError> {
    context.require_access(&app)?;

    let progress = spinner("Downloading configuration...");

    let files = match pull_config(&context.store, &app, &destination) {
        Ok(files) => files,
        Err(error) => {
            progress.finish_with_message("Download failed.");
            return Err(error.into());
        }
    };

    progress.finish_with_message(format!(
        "Downloaded {} configuration files of {app} into {}",
        files.len(),
        destination.join(&app).display()
    ));

    Ok(())
}

/// Upload a compose file, both to the repository and to the app's server.
pub(crate) fn push(context: &Context, Push { app, file }: Push) -> Result<(), CommandError> {
    let username = context.require_access(&app)?;

    let shell = OpenSsh::new()?;
    let bridge = RemoteBridge::new(
        &context.store,
        &shell,
        context.state_dir.clone(),
        context.config.remote.user.clone(),
    );

    let progress = spinner("Pushing configuration...");

    let outcome = match bridge.push_config(&username, &app, &file) {
        Ok(outcome) => outcome,
        Err(error) => {
            progress.finish_with_message("Push failed.");
            return Err(error.into());
        }
    };

    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let verb = match outcome {
        PushOutcome::Added => "Added",
        PushOutcome::Updated => "Updated",
    };

    progress.finish_with_message(format!("{verb} {file_name} for {app}"));
    context
        .notifier
        .notify(&format!("User {username} pushed {file_name} for {app}"));

    Ok(())
}
