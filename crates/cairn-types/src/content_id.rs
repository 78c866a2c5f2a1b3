use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error parsing or decoding a content ID.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("empty content ID")]
    Empty,

    #[error("invalid content ID: '{0}'")]
    InvalidContentId(String),

    #[error("invalid content ID key bytes")]
    InvalidKeyBytes,
}

/// Identifier of a single deduplicated chunk inside a pack blob.
///
/// Printable form: an optional one-character prefix in `g..=z` followed by an
/// even-length lowercase-hex hash, e.g. `aabbcc` or `kaabbcc`. The prefix
/// distinguishes metadata contents (directory manifests, manifest-system
/// blocks) from plain user contents.
///
/// Ordering is plain string ordering, which is identical to the ordering of
/// the binary key encoding used by pack indexes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Parse a printable content ID, validating prefix and hex hash.
    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        if s.is_empty() {
            return Err(IdParseError::Empty);
        }

        let first = s.as_bytes()[0];
        let hash = if (b'g'..=b'z').contains(&first) {
            &s[1..]
        } else {
            s
        };

        if hash.is_empty() || hash.len() % 2 != 0 {
            return Err(IdParseError::InvalidContentId(s.to_string()));
        }
        if !hash
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(IdParseError::InvalidContentId(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// Build a content ID from an optional prefix character and raw hash bytes.
    pub fn from_hash(prefix: Option<char>, hash: &[u8]) -> Result<Self, IdParseError> {
        if hash.is_empty() {
            return Err(IdParseError::Empty);
        }
        let mut s = String::with_capacity(1 + hash.len() * 2);
        if let Some(p) = prefix {
            if !('g'..='z').contains(&p) {
                return Err(IdParseError::InvalidContentId(p.to_string()));
            }
            s.push(p);
        }
        s.push_str(&hex::encode(hash));
        Ok(Self(s))
    }

    /// Decode a content ID from its binary key encoding: one prefix byte
    /// (0 when absent) followed by the raw hash bytes.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, IdParseError> {
        if key.len() < 2 {
            return Err(IdParseError::InvalidKeyBytes);
        }
        let prefix = match key[0] {
            0 => None,
            b @ b'g'..=b'z' => Some(b as char),
            _ => return Err(IdParseError::InvalidKeyBytes),
        };
        Self::from_hash(prefix, &key[1..])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The one-character namespace prefix, if present.
    pub fn prefix(&self) -> Option<char> {
        let first = self.0.as_bytes()[0];
        if (b'g'..=b'z').contains(&first) {
            Some(first as char)
        } else {
            None
        }
    }

    fn hash_hex(&self) -> &str {
        match self.prefix() {
            Some(_) => &self.0[1..],
            None => &self.0,
        }
    }

    /// Binary key encoding: one prefix byte (0 when absent) followed by the
    /// raw hash bytes. All IDs within one pack index share the same key length.
    pub fn key_bytes(&self) -> Vec<u8> {
        let hash = self.hash_hex();
        let mut out = Vec::with_capacity(1 + hash.len() / 2);
        out.push(self.prefix().map_or(0, |p| p as u8));
        out.extend(hex::decode(hash).expect("hash validated at construction"));
        out
    }

    /// Length of the binary key encoding in bytes.
    pub fn key_len(&self) -> usize {
        1 + self.hash_hex().len() / 2
    }
}

impl FromStr for ContentId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_hex() {
        let id = ContentId::parse("aabbcc").unwrap();
        assert_eq!(id.as_str(), "aabbcc");
        assert_eq!(id.prefix(), None);
        assert_eq!(id.key_len(), 4);
        assert_eq!(id.key_bytes(), vec![0, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn parse_prefixed() {
        let id = ContentId::parse("kaabbcc").unwrap();
        assert_eq!(id.prefix(), Some('k'));
        assert_eq!(id.key_bytes(), vec![b'k', 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn parse_rejects_invalid() {
        assert_eq!(ContentId::parse(""), Err(IdParseError::Empty));
        assert!(ContentId::parse("xyz").is_err()); // odd-length hash
        assert!(ContentId::parse("AABB").is_err()); // uppercase
        assert!(ContentId::parse("k").is_err()); // prefix without hash
        assert!(ContentId::parse("aabbc").is_err()); // odd length
    }

    #[test]
    fn key_bytes_roundtrip() {
        for s in ["aabbcc", "de1e1e", "kaabbcc", "z010203", "00ff"] {
            let id = ContentId::parse(s).unwrap();
            let back = ContentId::from_key_bytes(&id.key_bytes()).unwrap();
            assert_eq!(id, back);
        }
    }

    #[test]
    fn from_key_bytes_rejects_invalid() {
        assert!(ContentId::from_key_bytes(&[]).is_err());
        assert!(ContentId::from_key_bytes(&[0]).is_err());
        assert!(ContentId::from_key_bytes(&[b'A', 0xaa]).is_err());
    }

    #[test]
    fn string_order_matches_key_byte_order() {
        let ids = ["0011", "aabbcc", "ddeeff", "de1e1e", "k010203", "xaabbcc"];
        for a in &ids {
            for b in &ids {
                let ia = ContentId::parse(a).unwrap();
                let ib = ContentId::parse(b).unwrap();
                assert_eq!(
                    ia.cmp(&ib),
                    ia.key_bytes().cmp(&ib.key_bytes()),
                    "order mismatch between {a} and {b}"
                );
            }
        }
    }
}
