//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "02-model"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Collision-resistant identity allocation for scenario isolation."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
use std::fmt;

use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::IdentityError;

/// Length of the random suffix appended to every prefix.
pub const TOKEN_LEN: usize = 10;
/// API Management service names are capped at 50 characters.
pub const MAX_IDENTITY_LEN: usize = 50;

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Unique name allocated to one scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct Identity {
    prefix: String,
    token: String,
    full: String,
}

impl Identity {
    /// Caller supplied prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Random suffix.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Prefix followed by token.
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.full
    }
}

/// Allocate a fresh identity under `prefix`.
///
/// Each call seeds its own generator from the operating system entropy
/// source, so concurrent callers share nothing and need no lock.
pub fn allocate(prefix: &str) -> Result<Identity, IdentityError> {
    validate_prefix(prefix)?;
    let mut rng =
        StdRng::from_rng(OsRng).map_err(|err| IdentityError::Entropy(err.to_string()))?;
    let token: String = (0..TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect();
    Ok(Identity {
        prefix: prefix.to_owned(),
        full: format!("{prefix}{token}"),
        token,
    })
}

fn validate_prefix(prefix: &str) -> Result<(), IdentityError> {
    let invalid = |reason: &'static str| IdentityError::InvalidPrefix {
        prefix: prefix.to_owned(),
        reason,
    };
    match prefix.chars().next() {
        None => return Err(invalid("prefix must not be empty")),
        Some(first) if !first.is_ascii_lowercase() => {
            return Err(invalid("prefix must start with a lowercase letter"))
        }
        Some(_) => {}
    }
    if !prefix
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
    {
        return Err(invalid("prefix may only contain a-z, 0-9 and '-'"));
    }
    if prefix.len() + TOKEN_LEN > MAX_IDENTITY_LEN {
        return Err(invalid("prefix leaves no room for the random token"));
    }
    Ok(())
}
