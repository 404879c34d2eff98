use inquire::{Password, Text};
use store::access::{hash_password, AccessControl};

use crate::{commands::CommandError, context::Context};

/// Prompt for a non-empty username.
fn prompt_username() -> Result<String, CommandError> {
    let username = Text::new("Username:").prompt()?.trim().to_owned();

    if username.is_empty() {
        return Err(CommandError::EmptyInput { field: "username" });
    }

    Ok(username)
}

/// Login flow entrypoint.
pub(crate) fn login(context: &Context) -> Result<(), CommandError> {
    let username = prompt_username()?;
    let password = Password::new("Password:")
        .without_confirmation()
        .prompt()?;

    let (_, valid) = AccessControl::new(&context.store).verify_credentials(&username, &password)?;

    if !valid {
        return Err(CommandError::InvalidCredentials);
    }

    context.session.write(&username)?;

    println!("Login succeeded");

    Ok(())
}

/// Logout flow entrypoint.
pub(crate) fn logout(context: &Context) -> Result<(), CommandError> {
    if context.session.clear()? {
        println!("Successfully logged out");
    } else {
        println!("No user is currently logged in");
    }

    Ok(())
}

/// Signup flow entrypoint.
pub(crate) fn signup(context: &Context) -> Result<(), CommandError> {
    let username = prompt_username()?;
    let password = Password::new("Password:")
        .with_custom_confirmation_message("Password again:")
        .with_custom_confirmation_error_message("You entered two different passwords.")
        .prompt()?;

    if password.is_empty() {
        return Err(CommandError::EmptyInput { field: "password" });
    }

    AccessControl::new(&context.store).register_user(&username, &hash_password(&password)?)?;

    println!("New user registered with username {username}");
    context
        .notifier
        .notify(&format!("User {username} just signed up."));

    Ok(())
}

/// Account listing flow entrypoint.
pub(crate) fn ls(context: &Context) -> Result<(), CommandError> {
    let username = context.current_user()?;
    let user = AccessControl::new(&context.store).user(&username)?;

    if user.apps.is_empty() {
        println!("You don't have access to any apps.");
    } else {
        println!(
            "You have access to the following apps: {}",
            user.apps.join(", ")
        );
    }

    Ok(())
}
