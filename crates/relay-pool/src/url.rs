//! Relay URL normalization.
//!
//! Every relay in a pool is keyed by its [`RelayUrl`], so two spellings of the
//! same endpoint must normalize to the same value.
//!
//! # Normalization Rules
//!
//! - Trim surrounding whitespace
//! - A bare host (`nos.lol`, `relay.example.com:7777`) gets `wss://` prepended
//! - Only `ws://` and `wss://` are accepted
//! - Lowercase the scheme and host, drop the default port
//! - Remove trailing slashes
//! - Preserve non-default ports, paths and queries

use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

const DEFAULT_SCHEME: &str = "wss://";

/// Normalized relay endpoint identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Parse and normalize a relay URL.
    ///
    /// ```
    /// use relay_pool::RelayUrl;
    ///
    /// let bare = RelayUrl::parse("nos.lol").unwrap();
    /// let full = RelayUrl::parse("wss://nos.lol/").unwrap();
    /// assert_eq!(bare, full);
    /// assert_eq!(bare.as_str(), "wss://nos.lol");
    /// ```
    pub fn parse(input: &str) -> Result<Self, ClientError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ClientError::InvalidUrl("empty relay URL".to_string()));
        }

        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("{DEFAULT_SCHEME}{input}")
        };

        let parsed = Url::parse(&with_scheme)?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(ClientError::InvalidUrl(format!("missing host: {input}")));
        }

        let mut normalized = parsed.to_string();
        while normalized.ends_with('/') {
            normalized.pop();
        }

        Ok(Self(normalized))
    }

    /// The normalized URL string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The URL as a parsed [`Url`].
    pub fn to_url(&self) -> Result<Url, ClientError> {
        Ok(Url::parse(&self.0)?)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RelayUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = ClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for RelayUrl {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for RelayUrl {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for RelayUrl {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
