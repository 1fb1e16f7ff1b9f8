//! Sender identity derivation.
//!
//! A notification sender is only known by its display name, which can be any
//! Unicode string of any length. Matrix localparts are restricted to
//! `[a-z0-9._=/+-]`, so the display name is hashed into a short fixed-width
//! token that is safe to embed in both user IDs and room aliases.
//!
//! The token is one-way: recovering the display name requires the title map.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of hex characters kept from the SHA-256 digest (48 bits).
///
/// With 48 bits the birthday bound puts a 50% collision chance at roughly
/// 2^24 (~16.7 million) distinct senders. A single operator will never get
/// close, so collisions are accepted rather than detected.
pub const TOKEN_LEN: usize = 12;

/// Fixed-width lowercase hex token derived from a sender display name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityToken(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenParseError {
    #[error("identity token must be {TOKEN_LEN} characters (got {0})")]
    Length(usize),
    #[error("identity token must be lowercase hex (got {0:?})")]
    Charset(String),
}

impl IdentityToken {
    /// Derive the token for a display name.
    ///
    /// Pure and deterministic: the same name always yields the same token,
    /// across calls and across process restarts.
    #[must_use]
    pub fn derive(display_name: &str) -> Self {
        let digest = Sha256::digest(display_name.as_bytes());
        let hex: String = digest
            .iter()
            .take(TOKEN_LEN / 2)
            .map(|b| format!("{b:02x}"))
            .collect();
        Self(hex)
    }

    /// Validate an existing token string, e.g. one parsed out of a user ID.
    pub fn parse(raw: &str) -> Result<Self, TokenParseError> {
        if raw.len() != TOKEN_LEN {
            return Err(TokenParseError::Length(raw.len()));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(TokenParseError::Charset(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Best-effort label for a token whose display name is unknown.
    ///
    /// The hash cannot be reversed, so this never recovers the real name: the
    /// label is the hex token itself, unchanged. It exists so a reply is still
    /// delivered with *some* title when the title map has lost the entry.
    #[must_use]
    pub fn humanize(&self) -> String {
        self.0.clone()
    }
}

impl TryFrom<String> for IdentityToken {
    type Error = TokenParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdentityToken> for String {
    fn from(value: IdentityToken) -> Self {
        value.0
    }
}

impl AsRef<str> for IdentityToken {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
