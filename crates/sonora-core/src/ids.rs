//! Identifiers
//!
//! Opaque ids handed across the wire. Asset and transaction ids are random
//! UUIDs; channel keys are free-form strings chosen by whoever configures a
//! proxy, or derived from a position for standalone speakers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::math::BlockPos;

/// Opaque id of a stored audio asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub Uuid);

impl AssetId {
    /// Generate a fresh random asset id
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for AssetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Id of an upload transaction, chosen by the uploading party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    /// Generate a fresh random transaction id
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identity of a connected observer (a player or any other listener)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub Uuid);

impl ObserverId {
    /// Generate a fresh random observer id
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of a logical audio channel shared by every binding that names it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Prefix reserved for keys derived from a speaker position
    pub const POSITION_PREFIX: &'static str = "speaker@";

    /// Create a key from any string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive the private key of a standalone speaker
    pub fn for_position(pos: BlockPos) -> Self {
        Self(format!("{}{},{},{}", Self::POSITION_PREFIX, pos.x, pos.y, pos.z))
    }

    /// Whether this key was derived from a position
    pub fn is_positional(&self) -> bool {
        self.0.starts_with(Self::POSITION_PREFIX)
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_id_roundtrip_through_string() {
        let id = AssetId::new_random();
        let parsed: AssetId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(AssetId::new_random(), AssetId::new_random());
        assert_ne!(TransactionId::new_random(), TransactionId::new_random());
    }

    #[test]
    fn test_positional_channel_key() {
        let key = ChannelKey::for_position(BlockPos::new(1, -2, 3));
        assert_eq!(key.as_str(), "speaker@1,-2,3");
        assert!(key.is_positional());
        assert!(!ChannelKey::new("lobby").is_positional());
    }

    #[test]
    fn test_positional_keys_are_unique() {
        let a = ChannelKey::for_position(BlockPos::new(1, 23, 4));
        let b = ChannelKey::for_position(BlockPos::new(12, 3, 4));
        assert_ne!(a, b);
    }
}
