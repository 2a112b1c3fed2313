use anyhow::{Context, Result, bail};
use log::debug;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::runtime::Runtime;

/// Hex-encoded SHA-256 of a file.
#[tracing::instrument(skip(runtime))]
pub fn sha256_file<R: Runtime>(runtime: &R, path: &Path) -> Result<String> {
    let mut reader = runtime
        .open(path)
        .with_context(|| format!("Failed to open {:?} for hashing", path))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("Failed to read {:?}", path))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fail unless `path` hashes to `expected` (case-insensitive hex).
pub fn verify_checksum<R: Runtime>(runtime: &R, path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(runtime, path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "Checksum mismatch for {:?}: expected {}, got {}",
            path,
            expected,
            actual
        );
    }
    debug!("Checksum verified for {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        std::fs::write(&path, "hello").unwrap();
        assert_eq!(sha256_file(&RealRuntime, &path).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_verify_checksum_mismatch() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_open()
            .returning(|_| Ok(Box::new(std::io::Cursor::new(b"hello".to_vec()))));

        let path = Path::new("artifact.tar.gz");
        assert!(verify_checksum(&runtime, path, &HELLO_SHA256.to_uppercase()).is_ok());
        let err = verify_checksum(&runtime, path, "deadbeef").unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }
}
