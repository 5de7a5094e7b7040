//! Model file pinning.
//!
//! Embeddings from different model builds live in different spaces, so a
//! reference photo embedded by one build cannot be compared against a probe
//! embedded by another. Pinning the ONNX files by SHA-256 keeps every
//! extraction on the same build.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A pinned model file.
pub struct ModelFile {
    pub name: &'static str,
    pub sha256: &'static str,
}

pub const DETECTOR_MODEL: ModelFile = ModelFile {
    name: "det_10g.onnx",
    sha256: "5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91",
};

pub const RECOGNIZER_MODEL: ModelFile = ModelFile {
    name: "w600k_r50.onnx",
    sha256: "4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43",
};

pub const MODELS: [&ModelFile; 2] = [&DETECTOR_MODEL, &RECOGNIZER_MODEL];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    Missing { name: &'static str, path: PathBuf },
    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checksum mismatch for {name} ({path}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: &'static str,
        actual: String,
    },
}

/// Hex SHA-256 of a file, streamed in 8 KiB chunks.
pub fn sha256_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let io_err = |source| ModelIntegrityError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Check one model file inside `model_dir` against its pinned digest.
pub fn verify_model(model_dir: &Path, model: &ModelFile) -> Result<PathBuf, ModelIntegrityError> {
    let path = model_dir.join(model.name);
    if !path.is_file() {
        return Err(ModelIntegrityError::Missing {
            name: model.name,
            path,
        });
    }

    let actual = sha256_hex(&path)?;
    if actual != model.sha256 {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name: model.name,
            path,
            expected: model.sha256,
            actual,
        });
    }

    tracing::debug!(name = model.name, "model checksum verified");
    Ok(path)
}

pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        verify_model(model_dir, model)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.bin");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            sha256_hex(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_verify_model_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_model(dir.path(), &DETECTOR_MODEL).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::Missing { name: "det_10g.onnx", .. }));
    }

    #[test]
    fn test_verify_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RECOGNIZER_MODEL.name), b"not a model").unwrap();
        let err = verify_model(dir.path(), &RECOGNIZER_MODEL).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_verify_model_accepts_pinned_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("custom.onnx"), b"hello").unwrap();
        let pinned = ModelFile {
            name: "custom.onnx",
            sha256: "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        };
        let path = verify_model(dir.path(), &pinned).unwrap();
        assert!(path.ends_with("custom.onnx"));
    }

    #[test]
    fn test_verify_models_dir_reports_first_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify_models_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::Missing { name: "det_10g.onnx", .. }));
    }
}
