//! Newtype wrappers for string identifiers used across promotion and proxy code.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
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

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
            }
        }

        impl AsRef<std::path::Path> for $name {
            fn as_ref(&self) -> &std::path::Path {
                std::path::Path::new(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Package ecosystem a store serves, e.g. `maven`, `npm`, `generic-http`.
    PackageType
);

string_newtype!(
    /// Name of a store, unique within a `(package type, store type)` pair.
    StoreName
);

string_newtype!(
    /// Caller-supplied identifier correlating a promotion with its callback.
    PromotionId
);

impl PackageType {
    pub fn maven() -> Self {
        Self::new(MAVEN_PKG_KEY)
    }

    pub fn npm() -> Self {
        Self::new(NPM_PKG_KEY)
    }

    pub fn generic_http() -> Self {
        Self::new(GENERIC_PKG_KEY)
    }
}

impl PromotionId {
    /// Fresh random identifier for requests that did not bring their own.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

pub const MAVEN_PKG_KEY: &str = "maven";
pub const NPM_PKG_KEY: &str = "npm";
pub const GENERIC_PKG_KEY: &str = "generic-http";
