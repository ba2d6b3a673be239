use crate::foundation::BackendError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

pub type Hash32 = [u8; 32];

fn parse_hex_32bytes(s: &str) -> Result<Hash32, BackendError> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed)?;
    let array: Hash32 = bytes
        .try_into()
        .map_err(|_| BackendError::Serialization { format: "hex".to_string(), details: format!("expected 32 bytes in {s:?}") })?;
    Ok(array)
}

macro_rules! define_hash_id {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
        pub struct $name(Hash32);

        impl $name {
            pub const fn new(value: Hash32) -> Self {
                Self(value)
            }

            pub fn as_hash(&self) -> &Hash32 {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }

        impl FromStr for $name {
            type Err = BackendError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(parse_hex_32bytes(s)?))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_string())
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    s.parse().map_err(serde::de::Error::custom)
                } else {
                    let bytes = Hash32::deserialize(deserializer)?;
                    Ok(Self(bytes))
                }
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl Deref for $name {
            type Target = Hash32;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<Hash32> for $name {
            fn from(value: Hash32) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Hash32 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

define_hash_id!(ProjectId);
define_hash_id!(PledgeHash);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_from_str_accepts_prefixed_and_unprefixed() {
        let hex_prefixed = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";
        let id1: ProjectId = hex_prefixed.parse().expect("project id parse");
        assert_eq!(id1.to_string(), "1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef");

        let hex_unprefixed = "1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";
        let id2: ProjectId = hex_unprefixed.parse().expect("project id parse");
        assert_eq!(id1, id2);

        assert!("not-hex".parse::<ProjectId>().is_err());
        assert!("0xabcd".parse::<ProjectId>().is_err());
    }

    #[test]
    fn pledge_hash_serde_json_is_hex_string() {
        let hash = PledgeHash::new([0xAB; 32]);
        let json = serde_json::to_string(&hash).expect("serialize json");
        assert_eq!(json, format!("\"{}\"", hash));
        let decoded: PledgeHash = serde_json::from_str(&json).expect("deserialize json");
        assert_eq!(decoded, hash);
    }

    #[test]
    fn pledge_hash_bincode_is_fixed_width() {
        let hash = PledgeHash::new([0xCD; 32]);
        let bytes = bincode::serialize(&hash).expect("serialize bincode");
        assert_eq!(bytes.len(), 32);
    }
}
