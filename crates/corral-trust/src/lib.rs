//! Trustee identity and cluster PKI lifecycle.
//!
//! Every cluster gets a dedicated trustee user plus a trust delegation,
//! and a CA bundle whose private keys are encrypted before they are
//! persisted. User CSRs are signed against the cluster CA; the CA key
//! never leaves the configured storage backend in the clear.

pub mod encrypt;
pub mod manager;
pub mod pki;
pub mod trustee;

pub use manager::{CaKind, CertBundle, TrustCertManager};
pub use trustee::TrusteeCredentials;
