use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::{SystemTime, SystemTimeError};

/// A Unix timestamp represented as a `u64`, used in payment authorization windows.
///
/// Encodes seconds since the Unix epoch. Appears in ERC-3009
/// `transferWithAuthorization` messages as the `validAfter`/`validBefore`
/// bounds of an authorization.
///
/// Accepted on the wire as either a JSON number or a stringified integer,
/// since clients differ on how they encode the window bounds. Serialized back
/// as a string to avoid loss of precision in JSON.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq)]
pub struct UnixTimestamp(pub u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum NumberOrString {
            Number(u64),
            String(String),
        }
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(ts) => Ok(UnixTimestamp(ts)),
            NumberOrString::String(s) => {
                let ts = s.parse::<u64>().map_err(|_| {
                    serde::de::Error::custom("timestamp must be a non-negative integer")
                })?;
                Ok(UnixTimestamp(ts))
            }
        }
    }
}

impl From<UnixTimestamp> for U256 {
    fn from(value: UnixTimestamp) -> Self {
        U256::from(value.0)
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0 + rhs)
    }
}

impl UnixTimestamp {
    pub fn try_now() -> Result<Self, SystemTimeError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_secs();
        Ok(Self(now))
    }

    pub fn seconds_since_epoch(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_number_and_string() {
        let from_number: UnixTimestamp = serde_json::from_str("1699999999").unwrap();
        let from_string: UnixTimestamp = serde_json::from_str("\"1699999999\"").unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(from_number.seconds_since_epoch(), 1699999999);
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&UnixTimestamp(42)).unwrap();
        assert_eq!(json, "\"42\"");
    }
}
