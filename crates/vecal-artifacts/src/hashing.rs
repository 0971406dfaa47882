// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Content Hashing
// ─────────────────────────────────────────────────────────────────────

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use vecal_types::{VecalError, VecalResult};

/// Read buffer for streaming digests.
pub const HASH_BUFFER_BYTES: usize = 64 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Streaming SHA-256 of a file using a fixed 64 KiB buffer.
pub fn sha256_file(path: &Path) -> VecalResult<String> {
    let mut file = File::open(path).map_err(|e| VecalError::io(path, e))?;
    sha256_reader(&mut file).map_err(|e| VecalError::io(path, e))
}

pub fn sha256_reader<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_BYTES];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read a file once, returning its bytes and their digest together.
///
/// Used where the hash must describe exactly the bytes that were parsed.
pub fn read_hashed(path: &Path) -> VecalResult<(Vec<u8>, String)> {
    let bytes = std::fs::read(path).map_err(|e| VecalError::io(path, e))?;
    let digest = sha256_hex(&bytes);
    Ok((bytes, digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_streaming_matches_one_shot_across_buffer_boundary() {
        let data: Vec<u8> = (0..(HASH_BUFFER_BYTES * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let mut cursor = std::io::Cursor::new(data.clone());
        assert_eq!(sha256_reader(&mut cursor).unwrap(), sha256_hex(&data));
    }

    #[test]
    fn test_file_and_read_hashed_agree() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("x.csv");
        std::fs::write(&path, b"RPM/kPa,20\n1000,90.0000\n").unwrap();
        let (bytes, digest) = read_hashed(&path).unwrap();
        assert_eq!(digest, sha256_file(&path).unwrap());
        assert_eq!(bytes.len(), 24);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = sha256_file(Path::new("/nonexistent/vecal/file.csv")).unwrap_err();
        assert!(matches!(err, VecalError::Io { .. }));
    }
}
