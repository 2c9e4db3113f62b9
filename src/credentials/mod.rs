//! Credential hashing and validation
//!
//! - [`hash`] - `CredentialHash`, the resumption fingerprint
//! - [`validator`] - the `CredentialValidator` seam and built-in validators

pub mod hash;
pub mod validator;

pub use hash::CredentialHash;
pub use validator::{CredentialValidator, FormatValidator, ValidationOutcome, ValidatorFn};
