//! Secret-store contract.
//!
//! Payloads are opaque to the store; the conductor records only the
//! returned references. Private keys never appear in entity rows when
//! this backend is selected.

use async_trait::async_trait;

use corral_common::Result;

/// Store/retrieve/delete by opaque reference.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Persist a payload; returns an opaque reference.
    async fn store(&self, name: &str, payload: &[u8]) -> Result<String>;

    /// Fetch a payload by reference.
    async fn get(&self, secret_ref: &str) -> Result<Vec<u8>>;

    /// Delete a payload. Deleting an unknown reference is not an error.
    async fn delete(&self, secret_ref: &str) -> Result<()>;
}
