use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(ApplicationToken);
id_newtype!(DocumentId);

impl ApplicationToken {
    /// Canonical token form: trimmed, upper-cased.
    pub fn cleaned(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }

    /// Tokens issued at submission time are `HL` followed by 13 digits
    /// (a millisecond timestamp). User-supplied tokens must match exactly.
    pub fn is_wellformed(&self) -> bool {
        let Some(digits) = self.0.strip_prefix("HL") else {
            return false;
        };
        digits.len() == 13 && digits.bytes().all(|b| b.is_ascii_digit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    PendingDocuments,
    Processing,
}
