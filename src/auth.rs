//! Authentication Module
//!
//! The authentication gate runs once at the start of every session: prompt
//! for a username, prompt for a password, verify the pair, and report the
//! verdict to the peer. Verification itself is behind [`VerifyCredentials`]
//! so the server core never knows where credentials live; the bundled
//! implementation reads a line-oriented `username:password` file.
//!
//! There is no retry loop here. A rejected peer gets an explicit failure
//! message and the session ends; reconnecting is the client's business.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::protocol::{Framing, ProtocolError};
use crate::storage::Identity;

pub const USERNAME_PROMPT: &str = "Username: ";
pub const PASSWORD_PROMPT: &str = "Password: ";
pub const AUTH_SUCCESSFUL: &str = "Authentication Successful";
pub const AUTH_FAILED: &str = "Authentication Failed";

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// Credentials did not verify; the peer has been told.
    #[error("authentication rejected for user '{username}'")]
    Rejected { username: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Credential verification capability.
///
/// Implementations decide what a valid pair is; the gate only consumes the
/// boolean. Passwords must not be logged by implementations.
pub trait VerifyCredentials: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// Credential store backed by a `username:password` file.
///
/// The file is read once at construction. Lines without a `:` separator are
/// skipped with a warning; everything after the first `:` is the password.
pub struct CredentialFile {
    entries: HashMap<String, String>,
}

impl CredentialFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read credential file: {path:?}"))?;

        let mut entries = HashMap::new();
        for (number, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((username, password)) => {
                    entries.insert(username.to_string(), password.to_string());
                }
                None => warn!("Skipping malformed credential line {}", number + 1),
            }
        }

        info!("Loaded {} credential(s) from {:?}", entries.len(), path);
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VerifyCredentials for CredentialFile {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.entries
            .get(username)
            .is_some_and(|stored| stored == password)
    }
}

/// Run the authentication handshake on a fresh session.
///
/// Sends the two prompts, reads the two answers, verifies, and reports the
/// verdict as a control message. A username that is not usable as a storage
/// key (see [`Identity::parse`]) is rejected without consulting the store.
pub async fn authenticate<R, W>(
    reader: &mut R,
    writer: &mut W,
    verifier: &dyn VerifyCredentials,
) -> Result<Identity, AuthError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    Framing::send_control(writer, USERNAME_PROMPT).await?;
    let username = Framing::receive_control(reader).await?;
    let username = username.trim().to_string();

    Framing::send_control(writer, PASSWORD_PROMPT).await?;
    let password = Framing::receive_control(reader).await?;
    let password = password.trim();

    info!("Attempting authentication for user: {}", username);

    let identity = match Identity::parse(&username) {
        Ok(identity) if verifier.verify(&username, password) => identity,
        _ => {
            info!("Authentication failed for user: {}", username);
            Framing::send_control(writer, AUTH_FAILED).await?;
            return Err(AuthError::Rejected { username });
        }
    };

    info!("Authentication successful for user: {}", identity);
    Framing::send_control(writer, AUTH_SUCCESSFUL).await?;
    Ok(identity)
}
