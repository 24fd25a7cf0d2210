use std::fmt;

use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

/// The `pieces` key of the info dictionary: SHA-1 digests concatenated into
/// one byte string, 20 bytes per piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hashes(pub Vec<[u8; 20]>);

struct HashesVisitor;

impl<'de> Visitor<'de> for HashesVisitor {
    type Value = Hashes;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a byte string whose length is a multiple of 20")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.len() % 20 != 0 {
            return Err(E::custom(format!("pieces length {} not divisible by 20", v.len())));
        }
        Ok(Hashes(
            v.chunks_exact(20)
                .map(|chunk| {
                    let mut digest = [0u8; 20];
                    digest.copy_from_slice(chunk);
                    digest
                })
                .collect(),
        ))
    }
}

impl<'de> Deserialize<'de> for Hashes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(HashesVisitor)
    }
}

impl Serialize for Hashes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut flat = Vec::with_capacity(self.0.len() * 20);
        for digest in &self.0 {
            flat.extend_from_slice(digest);
        }
        serializer.serialize_bytes(&flat)
    }
}
