//! SHA-256 digests of single files and whole trees.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

use crate::fs::walker::walk_sorted;
use crate::utils::errors::{IoContext, Result};

/// Hex-encoded SHA-256 of one file's content.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).at_path("failed to open", path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).at_path("failed to read", path)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex-encoded SHA-256 over the content of every file below `root`, fed into
/// one running hash in lexicographic path order.
///
/// Only file bytes are hashed. Names, directory layout and metadata are not
/// part of the digest, so two trees whose files concatenate to the same bytes
/// in traversal order produce the same value. This is not a Merkle tree hash
/// and must not be relied on to detect renames or moves.
pub fn tree_checksum(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    walk_sorted(root, |info| {
        if info.is_dir {
            return Ok(());
        }
        let mut file = File::open(&info.path).at_path("failed to open", &info.path)?;
        io::copy(&mut file, &mut hasher).at_path("failed to read", &info.path)?;
        Ok(())
    })?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_file_checksum_known_value() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("abc.txt");
        fs::write(&path, b"abc")?;
        assert_eq!(
            file_checksum(&path)?,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }

    #[test]
    fn test_file_checksum_missing_file() {
        let err = file_checksum(Path::new("/no/such/file")).unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_tree_checksum_is_deterministic() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir(dir.path().join("sub"))?;
        fs::write(dir.path().join("a.txt"), b"alpha")?;
        fs::write(dir.path().join("sub/b.txt"), b"beta")?;

        let first = tree_checksum(dir.path())?;
        let second = tree_checksum(dir.path())?;
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        Ok(())
    }

    #[test]
    fn test_tree_checksum_tracks_content() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"alpha")?;
        fs::write(dir.path().join("c.txt"), b"gamma")?;
        let before = tree_checksum(dir.path())?;

        fs::write(dir.path().join("c.txt"), b"GAMMA")?;
        assert_ne!(tree_checksum(dir.path())?, before);
        Ok(())
    }

    #[test]
    fn test_tree_checksum_ignores_names() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), b"alpha")?;
        fs::write(dir.path().join("c.txt"), b"gamma")?;
        let before = tree_checksum(dir.path())?;

        // Same position in traversal order, same bytes.
        fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt"))?;
        assert_eq!(tree_checksum(dir.path())?, before);
        Ok(())
    }
}
