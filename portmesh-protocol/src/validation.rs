//! Frame validation for security hardening

use crate::frame::Frame;

/// Validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Principal too long: {len} bytes exceeds limit of {limit} bytes")]
    PrincipalTooLong { len: usize, limit: usize },

    #[error("Credential too long: {len} bytes exceeds limit of {limit} bytes")]
    CredentialTooLong { len: usize, limit: usize },

    #[error("Name too long: {len} bytes exceeds limit of {limit} bytes")]
    NameTooLong { len: usize, limit: usize },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Validation limits
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub max_principal_len: usize,
    pub max_credential_len: usize,
    /// Request names and channel types
    pub max_name_len: usize,
    pub max_payload_bytes: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_principal_len: 256,
            max_credential_len: 256,
            max_name_len: 64,
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

fn check_name(name: &str, limits: &ValidationLimits) -> Result<(), ValidationError> {
    if name.len() > limits.max_name_len {
        return Err(ValidationError::NameTooLong {
            len: name.len(),
            limit: limits.max_name_len,
        });
    }
    Ok(())
}

fn check_payload(size: usize, limits: &ValidationLimits) -> Result<(), ValidationError> {
    if size > limits.max_payload_bytes {
        return Err(ValidationError::PayloadTooLarge {
            size,
            limit: limits.max_payload_bytes,
        });
    }
    Ok(())
}

/// Validate a decoded frame against limits
pub fn validate_frame(frame: &Frame, limits: &ValidationLimits) -> Result<(), ValidationError> {
    match frame {
        Frame::Handshake(hs) => {
            if hs.principal.len() > limits.max_principal_len {
                return Err(ValidationError::PrincipalTooLong {
                    len: hs.principal.len(),
                    limit: limits.max_principal_len,
                });
            }
            if hs.credential.len() > limits.max_credential_len {
                return Err(ValidationError::CredentialTooLong {
                    len: hs.credential.len(),
                    limit: limits.max_credential_len,
                });
            }
        }
        Frame::GlobalRequest(req) => {
            check_name(&req.name, limits)?;
            check_payload(req.payload.len(), limits)?;
        }
        Frame::ChannelOpen(open) => {
            check_name(&open.channel_type, limits)?;
            check_payload(open.payload.len(), limits)?;
        }
        Frame::RequestSuccess { payload, .. } => check_payload(payload.len(), limits)?,
        Frame::Data { data, .. } => check_payload(data.len(), limits)?,
        _ => {}
    }
    Ok(())
}
