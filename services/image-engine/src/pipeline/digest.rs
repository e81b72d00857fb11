//! Rolling integrity checks over an image byte stream.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use vmimg_manifest::{Checksum, ChecksumAlgorithm};

use crate::error::ImgError;

enum ContentHasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Md5(Md5),
}

impl ContentHasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha1 => ContentHasher::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Md5 => ContentHasher::Md5(Md5::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Sha1(h) => h.update(data),
            ContentHasher::Sha256(h) => h.update(data),
            ContentHasher::Md5(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            ContentHasher::Sha1(h) => hex::encode(h.finalize()),
            ContentHasher::Sha256(h) => hex::encode(h.finalize()),
            ContentHasher::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

/// Content digest (always checked) plus an optional transfer MD5 (checked
/// only when the server sent `Content-MD5`), updated chunk by chunk.
pub struct RollingDigests {
    expected: Checksum,
    content: ContentHasher,
    transfer: Option<(String, Md5)>,
    bytes: u64,
}

impl RollingDigests {
    pub fn new(expected: Checksum, content_md5: Option<String>) -> Self {
        Self {
            content: ContentHasher::new(expected.algorithm),
            expected,
            transfer: content_md5.map(|md5| (md5, Md5::new())),
            bytes: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.content.update(chunk);
        if let Some((_, hasher)) = self.transfer.as_mut() {
            hasher.update(chunk);
        }
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Compare every digest against its expected value.
    pub fn verify(self) -> Result<(), ImgError> {
        if let Some((expected, hasher)) = self.transfer {
            let actual = BASE64.encode(hasher.finalize());
            if actual != expected {
                return Err(ImgError::download(format!(
                    "Content-MD5 mismatch: expected {expected}, got {actual}"
                )));
            }
        }

        let actual = self.content.finalize_hex();
        if !actual.eq_ignore_ascii_case(&self.expected.hex) {
            return Err(ImgError::download(format!(
                "{} digest mismatch: expected {}, got {actual}",
                self.expected.algorithm.as_str(),
                self.expected.hex
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA1: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

    fn sha1(hex: &str) -> Checksum {
        Checksum::new(ChecksumAlgorithm::Sha1, hex)
    }

    #[test]
    fn matching_digest_verifies() {
        let mut digests = RollingDigests::new(sha1("a9993e364706816aba3e25717850c26c9cd0d89d"), None);
        digests.update(b"a");
        digests.update(b"bc");
        assert_eq!(digests.bytes(), 3);
        digests.verify().unwrap();
    }

    #[test]
    fn mismatched_digest_is_download_error() {
        let mut digests = RollingDigests::new(sha1(EMPTY_SHA1), None);
        digests.update(b"not empty");
        let err = digests.verify().unwrap_err();
        assert_eq!(err.code(), "DownloadError");
    }

    #[test]
    fn transfer_md5_is_checked_when_present() {
        // md5("") in base64
        let digests = RollingDigests::new(sha1(EMPTY_SHA1), Some("1B2M2Y8AsgTpgAmY7PhCfg==".into()));
        digests.verify().unwrap();

        let mut digests = RollingDigests::new(sha1(EMPTY_SHA1), Some("bogus".into()));
        digests.update(b"");
        assert_eq!(digests.verify().unwrap_err().code(), "DownloadError");
    }

    #[test]
    fn sha256_content_digest() {
        let digests = RollingDigests::new(
            Checksum::new(
                ChecksumAlgorithm::Sha256,
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            ),
            None,
        );
        digests.verify().unwrap();
    }
}
