//! Generic HTTP blob store backend: `GET`/`PUT`/`DELETE` against
//! `base_url/<key>`.
//!
//! This is deliberately not an S3 client — request signing and the rest of
//! the S3 transport are out of scope (spec.md §1); this backend exists so
//! the `storage = s3` configuration can point at anything that speaks
//! plain HTTP object semantics (e.g. a signed-URL gateway in front of the
//! real bucket). It uses a synchronous client (`ureq`) to match the rest
//! of the crate's thread-based concurrency model rather than pulling in
//! an async runtime.

use std::io::Read;

use log::debug;

use super::{BlobStore, StoreError, StoreResult};

#[derive(Debug)]
pub struct HttpStore {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> HttpStore {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        HttpStore {
            base_url,
            agent: ureq::AgentBuilder::new().build(),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

impl BlobStore for HttpStore {
    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        debug!("http store GET {key}");
        match self.agent.get(&self.url_for(key)).call() {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .map_err(StoreError::Io)?;
                Ok(buf)
            }
            Err(ureq::Error::Status(404, _)) => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ))),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        debug!("http store PUT {key} ({} bytes)", bytes.len());
        self.agent
            .put(&self.url_for(key))
            .send_bytes(bytes)
            .map_err(|e| {
                StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        debug!("http store DELETE {key}");
        match self.agent.delete(&self.url_for(key)).call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(404, _)) => Err(StoreError::NotFound),
            Err(e) => Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            ))),
        }
    }
}
