//! Patient identifier derivation.
//!
//! A patient is keyed on the ledger by the SHA-256 of their biometric template.
//! The template itself never leaves this module: it is normalized, hashed and
//! dropped. Nothing here logs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::digest::{Digest, ParseDigestError};
use crate::error::RegistryError;

/// Stable, one-way identifier of a patient.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientIdentifier(Digest);

impl PatientIdentifier {
    pub fn digest(&self) -> &Digest {
        &self.0
    }

    /// First eight hex digits, for log fields.
    pub fn short(&self) -> String {
        let mut hex = self.0.to_hex();
        hex.truncate(8);
        hex
    }
}

impl fmt::Display for PatientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Debug for PatientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PatientIdentifier({})", self.short())
    }
}

impl FromStr for PatientIdentifier {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Derive the patient identifier for a biometric template.
///
/// Surrounding whitespace is trimmed before hashing, since capture devices
/// append line breaks to base64 templates. The remainder must be non-empty and
/// free of control characters.
pub fn derive(template: &str) -> Result<PatientIdentifier, RegistryError> {
    let normalized = normalize(template)?;
    Ok(PatientIdentifier(Digest::of(normalized.as_bytes())))
}

fn normalize(template: &str) -> Result<&str, RegistryError> {
    let trimmed = template.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::InvalidTemplate {
            reason: "template is empty",
        });
    }
    if trimmed.chars().any(char::is_control) {
        return Err(RegistryError::InvalidTemplate {
            reason: "template contains control characters",
        });
    }
    Ok(trimmed)
}
