use store::access::{AccessControl, GrantOutcome};

use crate::{
    commands::{CommandError, Grant},
    context::Context,
};

/// Grant flow entrypoint.
pub(crate) fn grant(context: &Context, Grant { username, app }: Grant) -> Result<(), CommandError> {
    let admin = context.require_admin()?;

    match AccessControl::new(&context.store).grant_app_access(&username, &app)? {
        GrantOutcome::Granted => {
            println!("Granted user {username} access to {app}");
            context.notifier.notify(&format!(
                "User {admin} granted user {username} access to {app}."
            ));
        }
        GrantOutcome::AlreadyGranted => {
            println!("User {username} already has access to {app}");
        }
    }

    Ok(())
}
