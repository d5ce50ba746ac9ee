//! OCI-style digest strings: `"<algo>:<hex>"`.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use crate::error::{ImageError, ImageResult};

/// Compute the `sha256:<hex>` digest of a file.
pub fn file_digest(path: &Path) -> ImageResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Split a digest into `(algo, hex)`; rejects malformed strings.
pub fn split(digest: &str) -> ImageResult<(&str, &str)> {
    let (algo, hex) = digest
        .split_once(':')
        .ok_or_else(|| ImageError::InvalidDigest(digest.to_string()))?;

    if algo.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ImageError::InvalidDigest(digest.to_string()));
    }

    Ok((algo, hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello").unwrap();

        let digest = file_digest(&path).unwrap();
        assert_eq!(
            digest,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn split_accepts_well_formed() {
        let (algo, hex) = split("sha256:abcdef0123").unwrap();
        assert_eq!(algo, "sha256");
        assert_eq!(hex, "abcdef0123");
    }

    #[test]
    fn split_rejects_malformed() {
        assert!(split("sha256").is_err());
        assert!(split(":abcdef").is_err());
        assert!(split("sha256:").is_err());
        assert!(split("sha256:xyz").is_err());
    }
}
