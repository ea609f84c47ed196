//! Credential checks for the tunnel handshake

use subtle::ConstantTimeEq;

/// Constant-time comparison of two byte slices
///
/// Slices of different lengths compare unequal without inspecting content.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Validate credential format
///
/// Returns Ok(()) if the credential is valid, Err with reason if not
pub fn validate_credential_format(
    credential: &str,
    max_len: usize,
) -> Result<(), CredentialValidationError> {
    if credential.is_empty() {
        return Err(CredentialValidationError::Empty);
    }
    if credential.len() > max_len {
        return Err(CredentialValidationError::TooLong {
            len: credential.len(),
            max: max_len,
        });
    }
    if !credential
        .chars()
        .all(|c| c.is_ascii() && !c.is_ascii_control())
    {
        return Err(CredentialValidationError::InvalidCharacters);
    }
    Ok(())
}

/// Credential validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialValidationError {
    #[error("credential is empty")]
    Empty,
    #[error("credential too long: {len} bytes exceeds maximum of {max} bytes")]
    TooLong { len: usize, max: usize },
    #[error("credential contains invalid characters")]
    InvalidCharacters,
}

impl From<CredentialValidationError> for portmesh_common::TunnelError {
    fn from(err: CredentialValidationError) -> Self {
        portmesh_common::TunnelError::Authentication(err.to_string())
    }
}
