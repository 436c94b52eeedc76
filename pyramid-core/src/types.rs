//! Identifier types shared by the signaling layer

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::{Error, Result};

/// Alphabet for generated peer ids (alphanumeric, matches the id space other clients use)
const PEER_ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'a', 'B', 'b', 'C', 'c', 'D', 'd',
    'E', 'e', 'F', 'f', 'G', 'g', 'H', 'h', 'I', 'i', 'J', 'j', 'K', 'k', 'L', 'l', 'M', 'm',
    'N', 'n', 'O', 'o', 'P', 'p', 'Q', 'q', 'R', 'r', 'S', 's', 'T', 't', 'U', 'u', 'V', 'v',
    'W', 'w', 'X', 'x', 'Y', 'y', 'Z', 'z',
];

const PEER_ID_LEN: usize = 20;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identifier of one participant, unique within a room
    PeerId
}

string_id! {
    /// Name of a rendezvous room (usually a descriptor id or a `restream-` token)
    RoomName
}

string_id! {
    /// Identifier of an opaque media stream handle
    StreamId
}

string_id! {
    /// Content-derived identifier of a published stream descriptor
    DescriptorId
}

impl PeerId {
    /// Generate a fresh 20-character alphanumeric peer id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid!(PEER_ID_LEN, &PEER_ID_ALPHABET))
    }
}

/// Build a relay topic from its parts (`app@room`)
#[must_use]
pub fn topic_path(parts: &[&str]) -> String {
    parts.join("@")
}

/// URL of a rendezvous relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayEndpoint(Url);

impl RelayEndpoint {
    /// Parse and validate a relay URL; only `ws` and `wss` are accepted
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| Error::InvalidInput(format!("invalid relay url {raw:?}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self(url)),
            other => Err(Error::InvalidInput(format!(
                "relay url {raw:?} has unsupported scheme {other:?}"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl TryFrom<String> for RelayEndpoint {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RelayEndpoint> for String {
    fn from(endpoint: RelayEndpoint) -> Self {
        endpoint.0.into()
    }
}
