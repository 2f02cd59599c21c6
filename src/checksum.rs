//! Content digests.
//!
//! Every dedup and cache-validity decision goes through [`ContentHash`]: a
//! digest tagged with its algorithm, written `"<algorithm>:<hexdigest>"`.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::ImageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha224 => "sha224",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }
}

impl FromStr for Algorithm {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha224" => Ok(Algorithm::Sha224),
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(ImageError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// An algorithm-tagged digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash {
    algorithm: Algorithm,
    hex: String,
}

impl ContentHash {
    pub fn new(algorithm: Algorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into(),
        }
    }

    /// Parse `"<algorithm>:<hexdigest>"`.
    pub fn parse(value: &str) -> Result<Self, ImageError> {
        let (alg, hex) = value
            .split_once(':')
            .ok_or_else(|| ImageError::MalformedHash(value.to_string()))?;
        if hex.is_empty() || hex.contains(':') || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ImageError::MalformedHash(value.to_string()));
        }
        Ok(Self {
            algorithm: alg.parse()?,
            hex: hex.to_string(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Stream a reader through the named digest, returning lowercase hex.
pub fn hash_reader<R: Read>(algorithm: Algorithm, reader: R) -> std::io::Result<String> {
    match algorithm {
        Algorithm::Sha224 => digest_stream::<Sha224, R>(reader),
        Algorithm::Sha256 => digest_stream::<Sha256, R>(reader),
        Algorithm::Sha384 => digest_stream::<Sha384, R>(reader),
        Algorithm::Sha512 => digest_stream::<Sha512, R>(reader),
    }
}

fn digest_stream<D: Digest, R: Read>(reader: R) -> std::io::Result<String> {
    let mut r = BufReader::new(reader);
    let mut hasher = D::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Hash a file on disk.
pub fn hash_file(path: &Path, algorithm: Algorithm) -> Result<ContentHash, ImageError> {
    if !path.is_file() {
        return Err(ImageError::NotFound(path.to_path_buf()));
    }
    let f = File::open(path)?;
    Ok(ContentHash::new(algorithm, hash_reader(algorithm, f)?))
}

/// Check that `path` hashes to `expected`.
///
/// The comparison is byte-exact against the lowercase hex the digest
/// produces; `id` only labels the error.
pub fn verify(path: &Path, expected: &ContentHash, id: &str) -> Result<(), ImageError> {
    let obtained = hash_file(path, expected.algorithm())?;
    if obtained.hex() != expected.hex() {
        return Err(ImageError::VerificationFailed {
            id: id.to_string(),
            expected: expected.hex().to_string(),
            obtained: obtained.hex().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn parse_splits_algorithm_and_digest() {
        let hash = ContentHash::parse(&format!("sha256:{HELLO_SHA256}")).unwrap();
        assert_eq!(hash.algorithm(), Algorithm::Sha256);
        assert_eq!(hash.hex(), HELLO_SHA256);
        assert_eq!(hash.to_string(), format!("sha256:{HELLO_SHA256}"));
    }

    #[test]
    fn parse_rejects_untagged_and_unknown() {
        assert!(matches!(
            ContentHash::parse(HELLO_SHA256),
            Err(ImageError::MalformedHash(_))
        ));
        assert!(matches!(
            ContentHash::parse("md4:abcd"),
            Err(ImageError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            ContentHash::parse("sha256:not-hex"),
            Err(ImageError::MalformedHash(_))
        ));
    }

    #[test]
    fn verify_accepts_matching_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("disk.img");
        fs::write(&path, b"hello").unwrap();

        let expected = ContentHash::parse(&format!("sha256:{HELLO_SHA256}")).unwrap();
        verify(&path, &expected, "img").unwrap();
    }

    #[test]
    fn verify_is_case_exact() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("disk.img");
        fs::write(&path, b"hello").unwrap();

        let upper = ContentHash::new(Algorithm::Sha256, HELLO_SHA256.to_uppercase());
        let err = verify(&path, &upper, "img").unwrap_err();
        assert!(matches!(err, ImageError::VerificationFailed { .. }));
    }

    #[test]
    fn verify_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let expected = ContentHash::new(Algorithm::Sha256, HELLO_SHA256);
        let err = verify(&tmp.path().join("absent"), &expected, "img").unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
    }

    #[test]
    fn sha512_matches_known_digest() {
        let hex = hash_reader(Algorithm::Sha512, &b"abc"[..]).unwrap();
        assert!(hex.starts_with("ddaf35a193617aba"));
        assert_eq!(hex.len(), 128);
    }
}
