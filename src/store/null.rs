//! A blob store that discards everything. Useful for `storage = null`
//! configurations where durability is intentionally not wanted (scratch
//! trees, benchmarking).

use super::{BlobStore, StoreError, StoreResult};

#[derive(Debug, Default)]
pub struct NullStore;

impl BlobStore for NullStore {
    fn get(&self, _key: &str) -> StoreResult<Vec<u8>> {
        Err(StoreError::NotFound)
    }

    fn put(&self, _key: &str, _bytes: &[u8]) -> StoreResult<()> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_is_still_not_found() {
        let s = NullStore;
        s.put("k", b"v").unwrap();
        assert!(matches!(s.get("k"), Err(StoreError::NotFound)));
    }
}
