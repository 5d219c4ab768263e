//! Student and exercise identifiers
//!
//! Both IDs come from outside (the classroom integration and the corpus
//! layout) and end up embedded in machine names, volume names and store
//! paths, so they are validated once at the edge and carried as newtypes.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Longest ID accepted; platform machine names cap at 63 characters.
pub const MAX_ID_LEN: usize = 63;

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("id pattern is a valid regex")
});

fn validate(kind: &'static str, raw: &str) -> Result<(), IdError> {
    if raw.is_empty() {
        return Err(IdError::Empty { kind });
    }
    if raw.len() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            kind,
            len: raw.len(),
        });
    }
    if !ID_PATTERN.is_match(raw) {
        return Err(IdError::InvalidCharacters {
            kind,
            value: raw.to_string(),
        });
    }
    Ok(())
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw identifier
            ///
            /// # Errors
            /// Returns [`IdError`] if the value is empty, too long, or has
            /// characters outside `[A-Za-z0-9_-]`.
            pub fn new(raw: impl Into<String>) -> Result<Self, IdError> {
                let raw = raw.into();
                validate($kind, &raw)?;
                Ok(Self(raw))
            }

            /// Borrow the raw identifier
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Opaque student identity issued by the classroom integration
    StudentId,
    "student"
);

define_id!(
    /// Exercise identifier; also the directory name under the corpus root
    ExerciseId,
    "exercise"
);

/// Identifier validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Empty identifier
    #[error("{kind} id is empty")]
    Empty { kind: &'static str },

    /// Identifier longer than [`MAX_ID_LEN`]
    #[error("{kind} id is {len} characters (max 63)")]
    TooLong { kind: &'static str, len: usize },

    /// Identifier has characters outside `[A-Za-z0-9_-]`
    #[error("{kind} id '{value}' may only contain letters, digits, '_' and '-'")]
    InvalidCharacters { kind: &'static str, value: String },
}
