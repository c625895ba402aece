//! Content checksums for chunk and whole-file verification.
//!
//! The algorithm is pluggable, but client and server must agree on it.
//! The default is SHA-256 rendered as lowercase hex.

use sha2::{Digest, Sha256};

use crate::{ChecksumScope, UploadError, UploadResult};

/// Incremental hasher produced by a [`ChecksumAlgorithm`]
pub trait ChecksumHasher: Send {
    fn update(&mut self, data: &[u8]);

    /// Consume the hasher and render the digest
    fn finalize(self: Box<Self>) -> String;
}

/// A content hash shared by client and server
pub trait ChecksumAlgorithm: Send + Sync {
    /// Short identifier such as `"sha256"`
    fn name(&self) -> &'static str;

    fn hasher(&self) -> Box<dyn ChecksumHasher>;

    fn digest(&self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

/// SHA-256, lowercase hex
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Checksum;

struct Sha256Hasher(Sha256);

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> String {
        format!("{:x}", self.0.finalize())
    }
}

impl ChecksumAlgorithm for Sha256Checksum {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn hasher(&self) -> Box<dyn ChecksumHasher> {
        Box::new(Sha256Hasher(Sha256::new()))
    }
}

/// Computes and compares checksums for chunks and assembled files
pub struct IntegrityVerifier {
    algorithm: Box<dyn ChecksumAlgorithm>,
}

impl IntegrityVerifier {
    pub fn new<A: ChecksumAlgorithm + 'static>(algorithm: A) -> Self {
        Self {
            algorithm: Box::new(algorithm),
        }
    }

    pub fn algorithm(&self) -> &dyn ChecksumAlgorithm {
        self.algorithm.as_ref()
    }

    pub fn compute(&self, data: &[u8]) -> String {
        self.algorithm.digest(data)
    }

    /// Verify `data` against a client-supplied checksum.
    ///
    /// Hex digests compare case-insensitively; surrounding whitespace is ignored.
    pub fn verify(&self, data: &[u8], expected: &str, scope: ChecksumScope) -> UploadResult<String> {
        self.check(self.compute(data), expected, scope)
    }

    /// Compare an already computed digest, e.g. one fed incrementally through
    /// [`ChecksumAlgorithm::hasher`], against a client-supplied checksum.
    pub fn check(&self, actual: String, expected: &str, scope: ChecksumScope) -> UploadResult<String> {
        if matches(&actual, expected) {
            Ok(actual)
        } else {
            Err(UploadError::ChecksumMismatch {
                scope,
                expected: expected.trim().to_string(),
                actual,
            })
        }
    }
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new(Sha256Checksum)
    }
}

fn matches(actual: &str, expected: &str) -> bool {
    actual.eq_ignore_ascii_case(expected.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        let verifier = IntegrityVerifier::default();
        assert_eq!(
            verifier.compute(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn incremental_matches_one_shot() {
        let algo = Sha256Checksum;
        let mut hasher = algo.hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), algo.digest(b"hello world"));
    }

    #[test]
    fn check_compares_streamed_digest() {
        let verifier = IntegrityVerifier::default();
        let mut hasher = verifier.algorithm().hasher();
        hasher.update(b"ab");
        hasher.update(b"cd");
        let expected = verifier.compute(b"abcd");

        assert_eq!(
            verifier.check(hasher.finalize(), &expected, ChecksumScope::File).unwrap(),
            expected
        );
        assert!(verifier
            .check("00".into(), &expected, ChecksumScope::File)
            .is_err());
    }

    #[test]
    fn verify_accepts_uppercase_and_rejects_wrong_digest() {
        let verifier = IntegrityVerifier::default();
        let digest = verifier.compute(b"chunk");

        assert!(verifier
            .verify(b"chunk", &digest.to_uppercase(), ChecksumScope::Chunk(1))
            .is_ok());

        let err = verifier
            .verify(b"chunk", "deadbeef", ChecksumScope::Chunk(4))
            .unwrap_err();
        match err {
            UploadError::ChecksumMismatch { scope, expected, actual } => {
                assert_eq!(scope, ChecksumScope::Chunk(4));
                assert_eq!(expected, "deadbeef");
                assert_eq!(actual, digest);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
