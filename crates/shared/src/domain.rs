use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ServerId);
id_newtype!(MessageId);

const TEMPORARY_MESSAGE_ID_PREFIX: &str = "temp-";

impl MessageId {
    /// Client-side placeholder used until the backend assigns an id.
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_MESSAGE_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_MESSAGE_ID_PREFIX)
    }
}

/// Which message stream a conversation view is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Direct { peer: UserId },
    Server { server_id: ServerId },
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { peer } => write!(f, "dm:{peer}"),
            Self::Server { server_id } => write!(f, "server:{server_id}"),
        }
    }
}
