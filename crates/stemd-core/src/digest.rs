//! Streaming SHA-256 helpers used to verify cached weight blobs.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Hex-encoded SHA-256 of a file, streamed in 1 MiB chunks.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Whether the file at `path` hashes to `expected` (hex, case-insensitive).
pub fn verify(path: &Path, expected: &str) -> Result<bool> {
    Ok(sha256_hex(path)?.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;
    use std::fs;

    #[test]
    fn test_sha256_of_known_payload() {
        let dir = scratch_dir("digest");
        let file = dir.join("payload.bin");
        fs::write(&file, "checksum-data").unwrap();

        let hash = sha256_hex(&file).unwrap();
        assert_eq!(
            hash,
            "40514c38a5c61b38be42cb94586683adef6de01e3c1dcfe11d317583affb8d87"
        );

        assert!(verify(&file, &hash.to_uppercase()).unwrap());
        assert!(!verify(
            &file,
            "84b597a6069a65b44616fb6b335a17088a647fdfb5ff3c662838e6c80c88ab0d"
        )
        .unwrap());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = scratch_dir("digest-missing");
        assert!(sha256_hex(&dir.join("nope.bin")).is_err());
        fs::remove_dir_all(&dir).ok();
    }
}
