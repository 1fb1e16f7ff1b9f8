use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::IdentityToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("{kind} must start with '{sigil}' (got {raw:?})")]
    Sigil {
        kind: &'static str,
        sigil: char,
        raw: String,
    },
    #[error("{kind} must have the form {sigil}localpart:server (got {raw:?})")]
    Shape {
        kind: &'static str,
        sigil: char,
        raw: String,
    },
}

/// Split `{sigil}{localpart}:{server}` into its two halves.
fn split_qualified<'a>(
    raw: &'a str,
    sigil: char,
    kind: &'static str,
) -> Result<(&'a str, &'a str), IdParseError> {
    let Some(rest) = raw.strip_prefix(sigil) else {
        return Err(IdParseError::Sigil {
            kind,
            sigil,
            raw: raw.to_string(),
        });
    };
    match rest.split_once(':') {
        Some((local, server)) if !local.is_empty() && !server.is_empty() => Ok((local, server)),
        _ => Err(IdParseError::Shape {
            kind,
            sigil,
            raw: raw.to_string(),
        }),
    }
}

/// Matrix user ID, `@localpart:server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdParseError> {
        let raw = raw.into();
        split_qualified(&raw, '@', "user ID")?;
        Ok(Self(raw))
    }

    #[must_use]
    pub fn new(localpart: &str, server: &str) -> Self {
        Self(format!("@{localpart}:{server}"))
    }

    #[must_use]
    pub fn localpart(&self) -> &str {
        self.parts().0
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        self.parts().1
    }

    fn parts(&self) -> (&str, &str) {
        // Validated at construction.
        self.0[1..].split_once(':').unwrap_or((&self.0[1..], ""))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Matrix room ID, `!opaque` (newer room versions drop the server part).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdParseError> {
        let raw = raw.into();
        match raw.strip_prefix('!') {
            Some(rest) if !rest.is_empty() => Ok(Self(raw)),
            Some(_) => Err(IdParseError::Shape {
                kind: "room ID",
                sigil: '!',
                raw,
            }),
            None => Err(IdParseError::Sigil {
                kind: "room ID",
                sigil: '!',
                raw,
            }),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Matrix room alias, `#localpart:server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomAlias(String);

impl RoomAlias {
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdParseError> {
        let raw = raw.into();
        split_qualified(&raw, '#', "room alias")?;
        Ok(Self(raw))
    }

    #[must_use]
    pub fn new(localpart: &str, server: &str) -> Self {
        Self(format!("#{localpart}:{server}"))
    }

    #[must_use]
    pub fn localpart(&self) -> &str {
        self.0[1..]
            .split_once(':')
            .map_or(&self.0[1..], |(local, _)| local)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomAlias {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomAlias> for String {
    fn from(value: RoomAlias) -> Self {
        value.0
    }
}

impl fmt::Display for RoomAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Naming convention for ghosts and their rooms.
///
/// A token `t` maps to the ghost `@{prefix}{t}:{domain}` and the room alias
/// `#{prefix}{t}:{domain}`. [`GhostNaming::parse_ghost`] is the only inverse;
/// nothing else should pick user IDs apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostNaming {
    prefix: String,
    domain: String,
}

impl GhostNaming {
    #[must_use]
    pub fn new(prefix: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            domain: domain.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn localpart(&self, token: &IdentityToken) -> String {
        format!("{}{token}", self.prefix)
    }

    #[must_use]
    pub fn ghost_user_id(&self, token: &IdentityToken) -> UserId {
        UserId::new(&self.localpart(token), &self.domain)
    }

    #[must_use]
    pub fn room_alias(&self, token: &IdentityToken) -> RoomAlias {
        RoomAlias::new(&self.localpart(token), &self.domain)
    }

    /// Extract the identity token from a ghost user ID.
    ///
    /// Returns `None` for users on another server, users outside the prefix,
    /// and prefixed users whose remainder is not a well-formed token.
    #[must_use]
    pub fn parse_ghost(&self, user: &UserId) -> Option<IdentityToken> {
        if user.server_name() != self.domain {
            return None;
        }
        let rest = user.localpart().strip_prefix(&self.prefix)?;
        IdentityToken::parse(rest).ok()
    }
}
