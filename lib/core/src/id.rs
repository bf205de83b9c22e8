//! Prefixed ULID identifiers for every persisted entity.
//!
//! Ids render as `<prefix>_<ulid>` (for example `cred_01J...`) so a value
//! seen in a log line or a webhook URL says which table it belongs to.
//! Parsing accepts both the prefixed and the bare ULID form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when an id string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// Name of the id type that rejected the input.
    pub id_type: &'static str,
    /// Why the input was rejected.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

fn parse_prefixed(
    input: &str,
    prefix: &str,
    id_type: &'static str,
) -> Result<Ulid, ParseIdError> {
    let raw = input
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(input);
    Ulid::from_str(raw).map_err(|e| ParseIdError {
        id_type,
        reason: e.to_string(),
    })
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Ulid);

        impl $name {
            /// Text prefix written before the ULID.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh id.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Wraps an existing ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the wrapped ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_prefixed(s, Self::PREFIX, stringify!($name)).map(Self)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseIdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }
    };
}

define_id!(
    /// An end user of the product.
    UserId,
    "usr"
);

define_id!(
    /// A workspace an integration can be scoped to.
    WorkspaceId,
    "ws"
);

define_id!(
    /// A logical connection between a user and a provider.
    IntegrationId,
    "int"
);

define_id!(
    /// A stored credential row.
    CredentialId,
    "cred"
);

define_id!(
    /// A tracked bootstrap attempt.
    SyncJobId,
    "job"
);

define_id!(
    /// A provider webhook registration.
    WebhookRegistrationId,
    "whk"
);

define_id!(
    /// A received provider webhook event.
    WebhookEventId,
    "evt"
);

define_id!(
    /// An entry in the integration audit log.
    IntegrationLogId,
    "log"
);
