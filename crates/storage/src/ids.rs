use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// UUID newtype that serializes as its hyphenated string.
macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Accepts any case; ids written by other clients may be uppercase.
            pub fn parse(raw: &str) -> StorageResult<Self> {
                Uuid::parse_str(raw.trim())
                    .map(Self)
                    .context(InvalidIdSnafu {
                        stage: "parse-uuid",
                        id_type: $label,
                        raw,
                    })
            }

            pub fn uuid(self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0.hyphenated(), formatter)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self::from_uuid(uuid)
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

uuid_newtype!(
    /// One saved conversation.
    SessionId,
    "session-id"
);
uuid_newtype!(
    /// One transcript entry; unique within its session.
    MessageId,
    "message-id"
);
