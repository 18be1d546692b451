//! Federation entry points.
//!
//! The federation entity exists in the store and is readable, but its
//! lifecycle transitions are reserved: every mutating RPC rejects.

use corral_common::{Error, RequestContext, Result};
use corral_store::Federation;

use crate::conductor::Conductor;

/// The rejection every mutating federation RPC returns.
pub fn not_implemented() -> Error {
    Error::not_supported("federation lifecycle operations are not implemented")
}

impl Conductor {
    pub async fn federation_create(&self, _rc: &RequestContext) -> Result<Federation> {
        Err(not_implemented())
    }

    pub async fn federation_update(&self, _rc: &RequestContext, _id: &str) -> Result<Federation> {
        Err(not_implemented())
    }

    pub async fn federation_delete(&self, _rc: &RequestContext, _id: &str) -> Result<()> {
        Err(not_implemented())
    }

    pub async fn federation_get(&self, rc: &RequestContext, id: &str) -> Result<Federation> {
        self.context().store.get_federation(rc, id)
    }

    pub async fn federation_list(&self, rc: &RequestContext) -> Result<Vec<Federation>> {
        self.context().store.list_federations(rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_not_supported() {
        assert_eq!(not_implemented().kind(), "NotSupported");
    }
}
