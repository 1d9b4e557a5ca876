//! Identifier generation.

use crate::common::Id;

/// Maps arbitrary bytes to a 160 bit [Id].
///
/// Implementations must be deterministic, and should be collision resistant.
pub trait HashProvider: std::fmt::Debug + Send + Sync {
    fn generate_id(&self, bytes: &[u8]) -> Id;
}

#[derive(Debug, Clone, Copy, Default)]
/// SHA-1, the original Kademlia id hash.
pub struct Sha1HashProvider;

impl HashProvider for Sha1HashProvider {
    fn generate_id(&self, bytes: &[u8]) -> Id {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(bytes);

        Id(hasher.digest().bytes())
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn sha1_known_vector() {
        let id = Sha1HashProvider.generate_id(b"The quick brown fox jumps over the lazy dog");

        assert_eq!(
            id,
            Id::from_str("2fd4e1c67a2d28fced849ee1bb76e7391b93eb12").unwrap()
        );
    }

    #[test]
    fn deterministic() {
        let provider = Sha1HashProvider;

        assert_eq!(provider.generate_id(b"node"), provider.generate_id(b"node"));
        assert_ne!(provider.generate_id(b"node"), provider.generate_id(b"node2"));
    }
}
