//! Checksum computation.
//!
//! This module provides:
//! - The supported algorithms (SHA-256 by default, BLAKE3)
//! - A streaming `ChecksumHasher` trait used while copying
//! - Helpers to checksum a reader or a file

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256 (cryptographic, 256-bit)
    #[default]
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            _ => Err(ValidationError::UnknownValue {
                field: "checksum algorithm",
                value: s.to_string(),
            }),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn into_hex(self) -> String {
        self.hex
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Incremental hasher fed while bytes stream through.
pub trait ChecksumHasher: Send {
    fn update(&mut self, data: &[u8]);

    fn finalize(self: Box<Self>) -> ChecksumValue;
}

/// SHA-256 hasher (backed by sha2 crate)
struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

/// BLAKE3 hasher (backed by blake3 crate)
struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        ChecksumValue::new(
            ChecksumAlgorithm::Blake3,
            self.hasher.finalize().to_hex().to_string(),
        )
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Checksum everything a reader yields, in `chunk_size` reads.
pub fn compute_reader_checksum<R: Read + ?Sized>(
    reader: &mut R,
    algorithm: ChecksumAlgorithm,
    chunk_size: usize,
) -> io::Result<ChecksumValue> {
    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(hasher.finalize())
}

/// Compute checksum for a file
pub fn compute_file_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<ChecksumValue> {
    let mut file = File::open(path)?;
    compute_reader_checksum(&mut file, algorithm, 64 * 1024)
}
