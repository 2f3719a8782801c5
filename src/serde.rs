//! Serde helpers.

/// Serializes a [`std::time::Duration`] as integer nanoseconds, the format
/// `hosts.json` records per-host durations in.
pub mod nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ns = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(ns))
    }
}
