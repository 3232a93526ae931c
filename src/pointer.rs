//! Content-hash pointers.
//!
//! A `Pointer` is the 32-byte SHA-256 hash of a sealed block's ciphertext
//! (data or metadata). The all-zero pointer is reserved to mean "no value"
//! (spec.md §3, *null* pointer).

use std::fmt;
use std::str::FromStr;

/// A 32-byte content-hash reference.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pointer(pub [u8; 32]);

impl Pointer {
    pub const NULL: Pointer = Pointer([0u8; 32]);

    pub fn is_null(&self) -> bool {
        *self == Pointer::NULL
    }

    pub fn from_hash(bytes: [u8; 32]) -> Pointer {
        Pointer(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The key used to address this pointer's value in a blob store.
    pub fn store_key(&self) -> String {
        self.to_hex()
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pointer({})", self.to_hex())
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for Pointer {
    fn default() -> Self {
        Pointer::NULL
    }
}

/// Error returned when a hex string does not decode to a 32-byte pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePointerError;

impl fmt::Display for ParsePointerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a 64-character hex pointer")
    }
}

impl std::error::Error for ParsePointerError {}

impl FromStr for Pointer {
    type Err = ParsePointerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|_| ParsePointerError)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| ParsePointerError)?;
        Ok(Pointer(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_pointer_round_trips() {
        assert!(Pointer::NULL.is_null());
        assert_eq!(Pointer::NULL.to_hex().len(), 64);
    }

    #[test]
    fn hex_round_trip() {
        let p = Pointer::from_hash([7u8; 32]);
        let s = p.to_hex();
        let back: Pointer = s.parse().unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("not-hex".parse::<Pointer>().is_err());
        assert!("aa".parse::<Pointer>().is_err());
    }
}
