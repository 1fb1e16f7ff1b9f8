//! Process configuration for the bridge.
//!
//! Everything comes from environment variables. The three `MATRIX_*`
//! variables and the two registration tokens are required; the rest have
//! defaults matching the stock phone-side setup (webhook on `:8090`, reply
//! endpoint at `http://redroid:8080/reply`).
//!
//! Parsing goes through [`BridgeConfig::from_lookup`] so tests can supply a
//! map instead of mutating the real environment.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use cona_types::{AccessToken, GhostNaming, UserId};
use thiserror::Error;
use url::Url;

pub const ENV_OPERATOR: &str = "MATRIX_USER_ID";
pub const ENV_HOMESERVER_URL: &str = "MATRIX_HOMESERVER_URL";
pub const ENV_DOMAIN: &str = "MATRIX_DOMAIN";
pub const ENV_AS_TOKEN: &str = "CONA_AS_TOKEN";
pub const ENV_HS_TOKEN: &str = "CONA_HS_TOKEN";
pub const ENV_LISTEN_ADDR: &str = "CONA_LISTEN_ADDR";
pub const ENV_REPLY_URL: &str = "CONA_REPLY_URL";
pub const ENV_SOURCE_PACKAGE: &str = "CONA_SOURCE_PACKAGE";
pub const ENV_GHOST_PREFIX: &str = "CONA_GHOST_PREFIX";
pub const ENV_ROOM_NAME_PREFIX: &str = "CONA_ROOM_NAME_PREFIX";
pub const ENV_BOT_LOCALPART: &str = "CONA_BOT_LOCALPART";
pub const ENV_TITLE_MAP_PATH: &str = "CONA_TITLE_MAP_PATH";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8090";
const DEFAULT_REPLY_URL: &str = "http://redroid:8080/reply";
const DEFAULT_SOURCE_PACKAGE: &str = "teams";
const DEFAULT_GHOST_PREFIX: &str = "teams_";
const DEFAULT_ROOM_NAME_PREFIX: &str = "Teams";
const DEFAULT_BOT_LOCALPART: &str = "teamsbot";
const DEFAULT_TITLE_MAP_PATH: &str = "title_map.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is not set")]
    Missing { var: &'static str },
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Which notifications count as coming from the bridged app.
///
/// A plain value matches any package name containing it, so the default
/// `teams` accepts every Teams flavour. Prefix the value with `=` to require
/// an exact package name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageFilter {
    Contains(String),
    Exact(String),
}

impl PackageFilter {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('=') {
            Some(exact) => Self::Exact(exact.to_string()),
            None => Self::Contains(raw.to_string()),
        }
    }

    #[must_use]
    pub fn matches(&self, package_name: &str) -> bool {
        match self {
            Self::Contains(needle) => package_name.contains(needle.as_str()),
            Self::Exact(expected) => package_name == expected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// The human operator; invited to every room, the only sender whose
    /// messages are forwarded back to the phone.
    pub operator: UserId,
    pub homeserver_url: Url,
    /// Server name used for ghost IDs and room aliases.
    pub domain: String,
    pub as_token: AccessToken,
    pub hs_token: AccessToken,
    pub listen_addr: SocketAddr,
    pub reply_url: Url,
    pub source_filter: PackageFilter,
    pub ghost_prefix: String,
    pub room_name_prefix: String,
    pub bot_localpart: String,
    pub title_map_path: PathBuf,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str| {
            lookup(var)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |var: &'static str| get(var).ok_or(ConfigError::Missing { var });
        let or_default =
            |var: &'static str, default: &str| get(var).unwrap_or_else(|| default.to_string());

        let operator =
            UserId::parse(required(ENV_OPERATOR)?).map_err(|e| ConfigError::Invalid {
                var: ENV_OPERATOR,
                reason: e.to_string(),
            })?;
        let homeserver_url = parse_http_url(ENV_HOMESERVER_URL, &required(ENV_HOMESERVER_URL)?)?;
        let domain = required(ENV_DOMAIN)?;
        if domain.contains('/') || domain.contains('@') {
            return Err(ConfigError::Invalid {
                var: ENV_DOMAIN,
                reason: format!("{domain:?} is not a server name"),
            });
        }

        let as_token = AccessToken::new(required(ENV_AS_TOKEN)?);
        let hs_token = AccessToken::new(required(ENV_HS_TOKEN)?);

        let listen_raw = or_default(ENV_LISTEN_ADDR, DEFAULT_LISTEN_ADDR);
        let listen_addr = listen_raw
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                var: ENV_LISTEN_ADDR,
                reason: format!("{listen_raw:?}: {e}"),
            })?;

        let reply_url =
            parse_http_url(ENV_REPLY_URL, &or_default(ENV_REPLY_URL, DEFAULT_REPLY_URL))?;
        let source_filter =
            PackageFilter::parse(&or_default(ENV_SOURCE_PACKAGE, DEFAULT_SOURCE_PACKAGE));

        let ghost_prefix = or_default(ENV_GHOST_PREFIX, DEFAULT_GHOST_PREFIX);
        validate_localpart(ENV_GHOST_PREFIX, &ghost_prefix)?;
        let bot_localpart = or_default(ENV_BOT_LOCALPART, DEFAULT_BOT_LOCALPART);
        validate_localpart(ENV_BOT_LOCALPART, &bot_localpart)?;

        let config = Self {
            operator,
            homeserver_url,
            domain,
            as_token,
            hs_token,
            listen_addr,
            reply_url,
            source_filter,
            ghost_prefix,
            room_name_prefix: or_default(ENV_ROOM_NAME_PREFIX, DEFAULT_ROOM_NAME_PREFIX),
            bot_localpart,
            title_map_path: PathBuf::from(or_default(ENV_TITLE_MAP_PATH, DEFAULT_TITLE_MAP_PATH)),
        };

        if config.operator.server_name() != config.domain {
            tracing::warn!(
                operator = %config.operator,
                domain = %config.domain,
                "Operator is not on the bridge domain"
            );
        }

        Ok(config)
    }

    #[must_use]
    pub fn ghost_naming(&self) -> GhostNaming {
        GhostNaming::new(self.ghost_prefix.clone(), self.domain.clone())
    }

    #[must_use]
    pub fn bot_user_id(&self) -> UserId {
        UserId::new(&self.bot_localpart, &self.domain)
    }
}

fn parse_http_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::Invalid {
        var,
        reason: format!("{raw:?}: {e}"),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            var,
            reason: format!("unsupported scheme {:?}", url.scheme()),
        });
    }
    Ok(url)
}

/// Matrix localparts are limited to `a-z 0-9 . _ = - / +`.
fn validate_localpart(var: &'static str, value: &str) -> Result<(), ConfigError> {
    let valid = value.bytes().all(|b| {
        b.is_ascii_lowercase()
            || b.is_ascii_digit()
            || matches!(b, b'.' | b'_' | b'=' | b'-' | b'/' | b'+')
    });
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            var,
            reason: format!("{value:?} contains characters not allowed in a Matrix localpart"),
        })
    }
}
