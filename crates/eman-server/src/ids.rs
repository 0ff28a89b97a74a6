//! Branded identifier types.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier string.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// Broker-issued service identity, `<name>.<millis>.<salt>`.
    ServiceId
);
branded_id!(
    /// Server-side handle for one accepted socket.
    ConnectionId
);

impl ServiceId {
    /// Issue a fresh id for a service declaring `name`.
    ///
    /// Format is `<name>.<unix millis>.<0..1000>`; uniqueness is
    /// probabilistic only.
    pub fn generate(name: &str) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let salt = rand::rng().random_range(0..1000);
        Self::generate_at(name, millis, salt)
    }

    /// Deterministic form of [`ServiceId::generate`].
    pub fn generate_at(name: &str, millis: i64, salt: u32) -> Self {
        Self(format!("{name}.{millis}.{salt}"))
    }
}

impl ConnectionId {
    /// Allocate a new connection id.
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}
