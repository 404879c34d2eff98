use crate::{
    commands::{CommandError, Notify},
    context::Context,
};

/// Notification flow entrypoint.
pub(crate) fn notify(context: &Context, Notify { message }: Notify) -> Result<(), CommandError> {
    let username = context.current_user()?;

    context.notifier.notify(&format!("{username}: {message}"));

    Ok(())
}
