//! Content digests (`sha256:<64 lowercase hex>`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

const SHA256_PREFIX: &str = "sha256:";
const SHA256_HEX_LEN: usize = 64;

/// A validated sha256 content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    ///
    /// Only `sha256` is accepted; the hex part must be 64 lowercase
    /// characters.
    pub fn parse(s: &str) -> Result<Self, String> {
        let hex_part = s
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| format!("unsupported digest algorithm in '{}'", s))?;
        if hex_part.len() != SHA256_HEX_LEN {
            return Err(format!(
                "digest '{}' has {} hex characters, expected {}",
                s,
                hex_part.len(),
                SHA256_HEX_LEN
            ));
        }
        if !hex_part
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(format!("digest '{}' is not lowercase hex", s));
        }
        Ok(Self(s.to_string()))
    }

    /// Compute the digest of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self(format!("{}{}", SHA256_PREFIX, hex::encode(Sha256::digest(data))))
    }

    /// Hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for display.
    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
