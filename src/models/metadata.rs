use std::{
    fmt,
    fs::{self, File},
    io::{self, BufReader, Read},
    path::Path,
    str::FromStr,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

const HASH_CHUNK_SIZE: usize = 64 * 1024;
const SHA256_PREFIX: &str = "sha256";

static DIGEST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?P<algorithm>[A-Za-z0-9-]+):)?(?P<hex>[0-9A-Fa-f]+)$")
        .expect("digest pattern is valid")
});

/// A sha256 content digest, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    hex: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("`{0}` is not a digest (expected sha256:<64 hex chars>)")]
    Malformed(String),
    #[error("unsupported digest algorithm `{0}`")]
    UnsupportedAlgorithm(String),
    #[error("sha256 digest must be 64 hex chars, got {0}")]
    Length(usize),
}

impl Digest {
    pub fn from_sha256_bytes(bytes: &[u8]) -> Self {
        Self {
            hex: format!("{:x}", Sha256::digest(bytes)),
        }
    }

    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHA256_PREFIX}:{}", self.hex)
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let captures = DIGEST_PATTERN
            .captures(trimmed)
            .ok_or_else(|| DigestParseError::Malformed(trimmed.to_string()))?;
        if let Some(algorithm) = captures.name("algorithm") {
            if !algorithm.as_str().eq_ignore_ascii_case(SHA256_PREFIX) {
                return Err(DigestParseError::UnsupportedAlgorithm(
                    algorithm.as_str().to_string(),
                ));
            }
        }
        let hex = &captures["hex"];
        if hex.len() != 64 {
            return Err(DigestParseError::Length(hex.len()));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch { expected: Digest, actual: Digest },
}

impl Verification {
    #[must_use]
    pub fn is_match(&self) -> bool {
        matches!(self, Verification::Match)
    }
}

pub fn digest_reader<R: Read>(reader: R) -> io::Result<Digest> {
    let mut reader = BufReader::with_capacity(HASH_CHUNK_SIZE, reader);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        hasher.update(&buffer[..read]);
    }

    Ok(Digest {
        hex: format!("{:x}", hasher.finalize()),
    })
}

pub fn compute_sha256(path: &Path) -> io::Result<Digest> {
    let file = File::open(path)?;
    digest_reader(file)
}

#[must_use]
pub fn verify(actual: &Digest, expected: &Digest) -> Verification {
    if actual == expected {
        Verification::Match
    } else {
        Verification::Mismatch {
            expected: expected.clone(),
            actual: actual.clone(),
        }
    }
}

pub fn verify_file(path: &Path, expected: &Digest) -> io::Result<Verification> {
    let actual = compute_sha256(path)?;
    Ok(verify(&actual, expected))
}

/// Verifies `path` and deletes it on mismatch so a bad artifact never stays on disk.
pub fn verify_or_discard(path: &Path, expected: &Digest) -> io::Result<Verification> {
    let verification = verify_file(path, expected)?;
    if let Verification::Mismatch { expected, actual } = &verification {
        tracing::warn!(
            "Checksum mismatch for {}: expected {expected}, got {actual}; discarding",
            path.display()
        );
        if let Err(error) = fs::remove_file(path) {
            tracing::warn!("Failed to discard {}: {error:?}", path.display());
        }
    }
    Ok(verification)
}
