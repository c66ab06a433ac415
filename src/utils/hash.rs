//! SHA3-256 digests for completed transfers.

use sha3::{Digest, Sha3_256};

pub type Digest256 = [u8; 32];

/// Incremental hasher fed chunk by chunk as bytes go out or come in.
#[derive(Default, Clone)]
pub struct TransferHasher {
    inner: Sha3_256,
}

impl TransferHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finalize(self) -> Digest256 {
        self.inner.finalize().into()
    }
}

pub fn sha3_256(data: &[u8]) -> Digest256 {
    Sha3_256::digest(data).into()
}

pub fn to_hex(digest: &Digest256) -> String {
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_one_shot() {
        let data = vec![0x5Au8; 100_000];
        let mut hasher = TransferHasher::new();
        for chunk in data.chunks(10_240) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finalize(), sha3_256(&data));
    }

    #[test]
    fn empty_digest_hex() {
        assert_eq!(
            to_hex(&sha3_256(b"")),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }
}
