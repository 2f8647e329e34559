use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// WhatsApp JID, e.g. `15551234567@s.whatsapp.net` or `1203...@g.us`.
id_newtype!(ChatId);
id_newtype!(MessageId);

impl ChatId {
    pub fn is_group(&self) -> bool {
        self.0.ends_with("@g.us")
    }
}

/// Who authored a message in a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// The other party of the conversation.
    Counterparty,
    /// Sent from the relay's own WhatsApp account (a human operator, or the relay itself).
    Operator,
}

impl Origin {
    pub fn from_me(from_me: bool) -> Self {
        if from_me {
            Origin::Operator
        } else {
            Origin::Counterparty
        }
    }

    pub fn is_from_me(self) -> bool {
        self == Origin::Operator
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender: String,
    pub text: String,
    pub origin: Origin,
    pub is_group: bool,
    /// Unix seconds as reported by the gateway.
    pub timestamp: Option<i64>,
}

/// Result of a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: Option<MessageId>,
}
