//! Serde helpers for values that should stay readable in JSON documents.

pub mod u256_dec {
    use ethereum_types::U256;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Accepts a decimal string, a `0x`-prefixed hex string or a JSON number.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match raw {
            serde_json::Value::String(s) => parse(&s).map_err(D::Error::custom),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(U256::from)
                .ok_or_else(|| D::Error::custom(format!("not an unsigned integer: {n}"))),
            other => Err(D::Error::custom(format!(
                "expected integer string, got {other}"
            ))),
        }
    }

    pub fn parse(s: &str) -> Result<U256, String> {
        let s = s.trim();
        match s.strip_prefix("0x") {
            Some(hex) => U256::from_str_radix(hex, 16).map_err(|e| format!("{s}: {e}")),
            None => U256::from_dec_str(s).map_err(|e| format!("{s}: {e:?}")),
        }
    }
}

pub mod bytes_hex {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        crate::utils::decode_hex(&s)
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::U256;

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(u256_dec::parse("1000"), Ok(U256::from(1000)));
        assert_eq!(u256_dec::parse("0x3e8"), Ok(U256::from(1000)));
        assert!(u256_dec::parse("ten").is_err());
    }
}
