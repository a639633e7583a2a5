use std::fmt;

use crate::error::ChatError;

/// Shortest secret or token accepted by local shape validation.
pub const MIN_CREDENTIAL_LEN: usize = 6;

/// Opaque DirectLine secret or token.
///
/// Only the shape is checked locally; the remote decides whether it is valid.
/// `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Validate `raw` and wrap it.
    pub fn parse(raw: impl Into<String>) -> Result<Self, ChatError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(ChatError::invalid_credential("credential is empty"));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ChatError::invalid_credential(
                "credential contains whitespace or control characters",
            ));
        }
        if raw.chars().count() < MIN_CREDENTIAL_LEN {
            return Err(ChatError::invalid_credential(format!(
                "credential is shorter than {MIN_CREDENTIAL_LEN} characters"
            )));
        }
        Ok(Self(raw))
    }

    /// Raw value, for building the `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}
