use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

// Stored as hyphenated text; v7 keeps ids in creation order.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident => $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            /// Accepts surrounding whitespace.
            pub fn parse(raw: &str) -> StorageResult<Self> {
                Uuid::parse_str(raw.trim()).map(Self).context(InvalidIdSnafu {
                    stage: concat!("parse-", $label),
                    id_type: $label,
                    raw,
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.hyphenated().fmt(formatter)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

uuid_id!(
    /// One conversation; every message belongs to exactly one session.
    SessionId => "session-id"
);
uuid_id!(MessageId => "message-id");
