//! Authentication state machine
//!
//! Runs once per connection before it is allowed into chat:
//!
//! ```text
//! Menu -> LoginName    -> Password(login)    -> Chat
//!      -> RegisterName -> Password(register) -> Menu
//! ```
//!
//! Every path back to the menu loops. Transport errors end the flow, and
//! so does a credential store failure during lookup or verification.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::session::SessionContext;
use crate::error::{ChatError, Result};
use crate::protocol::messages::{Envelope, ReplyKind};
use crate::transport::connection::{Connection, SessionReader};

pub const MAX_NAME_LEN: usize = 20;
pub const MAX_PASSWORD_ATTEMPTS: usize = 3;

const FORBIDDEN_NAME_CHARS: &str = "\\/:*?\"<>|";

const MENU_TEXT: &str = "Choose an option:\n1. Login\n2. Register";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,
    #[error("name cannot be longer than 20 characters")]
    TooLong,
    #[error("name may only contain printable ASCII characters")]
    NotPrintable,
    #[error("name cannot contain '{0}'")]
    Forbidden(char),
}

/// Check a display name: 1..=20 printable ASCII characters, none of
/// `\ / : * ? " < > |`
pub fn validate_name(name: &str) -> std::result::Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    for c in name.chars() {
        if !(' '..='~').contains(&c) {
            return Err(NameError::NotPrintable);
        }
        if FORBIDDEN_NAME_CHARS.contains(c) {
            return Err(NameError::Forbidden(c));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordMode {
    Login,
    Register,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Menu,
    LoginName,
    RegisterName,
    Password { name: String, mode: PasswordMode },
}

/// Drive `conn` through the menu until it logs in.
///
/// On success the name is already bound in the registry and the join
/// announcement has been queued.
pub async fn authenticate(
    ctx: &SessionContext,
    conn: &Arc<Connection>,
    reader: &mut SessionReader,
) -> Result<String> {
    let mut state = AuthState::Menu;

    loop {
        state = match state {
            AuthState::Menu => menu(ctx, conn, reader).await?,
            AuthState::LoginName => name_entry(ctx, conn, reader, PasswordMode::Login).await?,
            AuthState::RegisterName => name_entry(ctx, conn, reader, PasswordMode::Register).await?,
            AuthState::Password {
                name,
                mode: PasswordMode::Login,
            } => match login_password(ctx, conn, reader, &name).await? {
                Some(next) => next,
                None => return Ok(name),
            },
            AuthState::Password {
                name,
                mode: PasswordMode::Register,
            } => register_password(ctx, conn, reader, &name).await?,
        };
    }
}

async fn menu(ctx: &SessionContext, conn: &Arc<Connection>, reader: &mut SessionReader) -> Result<AuthState> {
    conn.reply(ReplyKind::Menu, MENU_TEXT).await?;
    loop {
        match ctx.recv(conn, reader).await?.trim() {
            "1" => return Ok(AuthState::LoginName),
            "2" => return Ok(AuthState::RegisterName),
            other => {
                debug!(conn_id = conn.id(), "invalid menu choice {:?}", other);
                conn.reply(ReplyKind::Invalid, "Invalid choice, enter 1 or 2:").await?;
            }
        }
    }
}

async fn name_entry(
    ctx: &SessionContext,
    conn: &Arc<Connection>,
    reader: &mut SessionReader,
    mode: PasswordMode,
) -> Result<AuthState> {
    conn.reply(ReplyKind::Prompt, "Enter your name:").await?;

    loop {
        let line = ctx.recv(conn, reader).await?;
        let name = line.trim();

        if let Err(e) = validate_name(name) {
            conn.reply(ReplyKind::Invalid, format!("Invalid name: {}. Enter your name:", e))
                .await?;
            continue;
        }
        // Registration only cares whether the name is known; an online name
        // always is.
        if mode == PasswordMode::Login && ctx.registry.is_taken(name).await {
            conn.reply(
                ReplyKind::NameOnline,
                format!("'{}' is already online. Enter another name:", name),
            )
            .await?;
            continue;
        }

        let exists = match ctx.credentials.name_exists(name).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(conn_id = conn.id(), "credential lookup failed: {}", e);
                conn.reply(ReplyKind::StoreUnavailable, "Service unavailable, please try again later")
                    .await?;
                return Err(e);
            }
        };

        let name = name.to_string();
        return match (mode, exists) {
            (PasswordMode::Login, false) => {
                conn.reply(
                    ReplyKind::NotRegistered,
                    format!("'{}' is not registered, returning to menu", name),
                )
                .await?;
                Ok(AuthState::Menu)
            }
            (PasswordMode::Login, true) => {
                conn.reply(ReplyKind::Prompt, format!("Enter the password for '{}':", name))
                    .await?;
                Ok(AuthState::Password { name, mode })
            }
            (PasswordMode::Register, true) => {
                conn.reply(
                    ReplyKind::AlreadyRegistered,
                    format!("'{}' is already registered, returning to menu", name),
                )
                .await?;
                Ok(AuthState::Menu)
            }
            (PasswordMode::Register, false) => {
                conn.reply(
                    ReplyKind::Prompt,
                    format!("'{}' is available. Choose a password:", name),
                )
                .await?;
                Ok(AuthState::Password { name, mode })
            }
        };
    }
}

/// `None` means logged in
async fn login_password(
    ctx: &SessionContext,
    conn: &Arc<Connection>,
    reader: &mut SessionReader,
    name: &str,
) -> Result<Option<AuthState>> {
    let mut failures = 0;

    loop {
        let password = ctx.recv(conn, reader).await?;
        if password.trim().is_empty() {
            conn.reply(ReplyKind::Invalid, "Password cannot be empty. Enter your password:")
                .await?;
            continue;
        }

        let verified = match ctx.credentials.verify_credentials(name, &password).await {
            Ok(verified) => verified,
            Err(e) => {
                warn!(conn_id = conn.id(), name = %name, "credential check failed: {}", e);
                conn.reply(ReplyKind::StoreUnavailable, "Service unavailable, please try again later")
                    .await?;
                return Err(e);
            }
        };

        if !verified {
            failures += 1;
            if failures >= MAX_PASSWORD_ATTEMPTS {
                info!(conn_id = conn.id(), name = %name, "too many failed logins");
                conn.reply(
                    ReplyKind::TooManyAttempts,
                    "Too many failed attempts, enter your name again",
                )
                .await?;
                return Ok(Some(AuthState::LoginName));
            }
            conn.reply(
                ReplyKind::PasswordRejected,
                format!(
                    "Wrong password, {} attempts left. Enter your password:",
                    MAX_PASSWORD_ATTEMPTS - failures
                ),
            )
            .await?;
            continue;
        }

        // Someone else may have logged in as this name since the check
        if !ctx.registry.try_register(name, conn).await {
            if ctx.shutdown.is_triggered() {
                return Err(ChatError::Closed);
            }
            conn.reply(
                ReplyKind::NameOnline,
                format!("'{}' came online in another session", name),
            )
            .await?;
            return Ok(Some(AuthState::LoginName));
        }

        info!(conn_id = conn.id(), peer = %conn.peer(), name = %name, "login succeeded");
        conn.reply(
            ReplyKind::Welcome,
            format!("Welcome {}! You are now chatting. Use /help to list commands", name),
        )
        .await?;
        ctx.submit(Envelope::system(format!("{} joined the chat", name)))
            .await?;
        return Ok(None);
    }
}

async fn register_password(
    ctx: &SessionContext,
    conn: &Arc<Connection>,
    reader: &mut SessionReader,
    name: &str,
) -> Result<AuthState> {
    let password = ctx.recv(conn, reader).await?;
    if password.trim().is_empty() {
        conn.reply(
            ReplyKind::RegistrationFailed,
            "Password cannot be empty, returning to menu",
        )
        .await?;
        return Ok(AuthState::Menu);
    }

    match ctx.credentials.register(name, &password).await {
        Ok(()) => {
            info!(conn_id = conn.id(), name = %name, "registration succeeded");
            conn.reply(
                ReplyKind::Registered,
                format!("'{}' registered, returning to menu", name),
            )
            .await?;
        }
        Err(e) => {
            warn!(conn_id = conn.id(), name = %name, "registration failed: {}", e);
            conn.reply(ReplyKind::RegistrationFailed, "Registration failed, returning to menu")
                .await?;
        }
    }
    Ok(AuthState::Menu)
}
