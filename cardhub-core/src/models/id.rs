//! Entity identifier newtypes
//!
//! All IDs are 12-character nanoids wrapped in their own type so a
//! `CallId` cannot be handed where a `UserId` belongs. Serialized
//! transparently as plain strings.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};

const ID_LENGTH: usize = 12;

/// Generate a fresh 12-character nanoid
pub fn generate_id() -> String {
    nanoid!(ID_LENGTH)
}

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(generate_id())
            }

            #[must_use]
            pub const fn from_string(id: String) -> Self {
                Self(id)
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_newtype! {
    /// Marketplace user identifier (issued upstream, validated here)
    UserId
}

id_newtype! {
    /// Conversation a message thread belongs to
    ConversationId
}

id_newtype! {
    /// Direct message identifier
    MessageId
}

id_newtype! {
    /// Call session identifier
    CallId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_have_fixed_length() {
        assert_eq!(generate_id().len(), ID_LENGTH);
        assert_eq!(UserId::new().as_str().len(), ID_LENGTH);
        assert_eq!(CallId::new().as_str().len(), ID_LENGTH);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(UserId::new(), UserId::new());
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn test_serializes_as_bare_string() {
        let id = UserId::from_string("alice".to_string());
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""alice""#);
    }
}
