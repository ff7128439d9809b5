//! Identity types for livedata.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// A 12-byte Mongo-style object id.
///
/// Displayed and stringified as 24 lowercase hex characters. Serialized as
/// `{"$oid": "<hex>"}` so it stays distinguishable from plain string ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "OidRepr", into = "OidRepr")]
pub struct ObjectId([u8; 12]);

#[derive(Serialize, Deserialize)]
struct OidRepr {
    #[serde(rename = "$oid")]
    oid: String,
}

impl ObjectId {
    /// Create a new random ObjectId.
    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create an ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of this ObjectId.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Lowercase 24-character hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ObjectId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 {
            return Err(TypesError::InvalidObjectId(s.to_string()));
        }
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| TypesError::InvalidObjectId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<OidRepr> for ObjectId {
    type Error = TypesError;

    fn try_from(repr: OidRepr) -> Result<Self, Self::Error> {
        repr.oid.parse()
    }
}

impl From<ObjectId> for OidRepr {
    fn from(id: ObjectId) -> Self {
        Self { oid: id.to_hex() }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

/// A document id.
///
/// Ids are compared structurally: two `ObjectId`s with the same bytes are the
/// same document even if they were parsed separately.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocId {
    /// Mongo-style object id.
    ObjectId(ObjectId),
    /// Integer id.
    Num(i64),
    /// Plain string id.
    Str(String),
}

impl DocId {
    /// Canonical string key for this id.
    ///
    /// The mapping is injective: strings that could be mistaken for an object
    /// id, a number or an escaped string are prefixed with `-`.
    pub fn stringify(&self) -> String {
        match self {
            DocId::ObjectId(oid) => oid.to_hex(),
            DocId::Num(n) => format!("~{}", n),
            DocId::Str(s) if s.is_empty() => String::new(),
            DocId::Str(s) => {
                let needs_escape = s.starts_with('-')
                    || s.starts_with('~')
                    || s.starts_with('{')
                    || looks_like_object_id(s);
                if needs_escape {
                    format!("-{}", s)
                } else {
                    s.clone()
                }
            }
        }
    }

    /// Inverse of [`DocId::stringify`].
    ///
    /// Total: keys that were not produced by `stringify` still map to some id.
    pub fn parse(key: &str) -> DocId {
        if let Some(rest) = key.strip_prefix('-') {
            return DocId::Str(rest.to_string());
        }
        if let Some(rest) = key.strip_prefix('~') {
            return match rest.parse::<i64>() {
                Ok(n) => DocId::Num(n),
                Err(_) => DocId::Str(key.to_string()),
            };
        }
        if looks_like_object_id(key) {
            if let Ok(oid) = key.parse() {
                return DocId::ObjectId(oid);
            }
        }
        DocId::Str(key.to_string())
    }

    /// JSON form used inside notifications and triggers.
    pub fn to_value(&self) -> Value {
        match self {
            DocId::ObjectId(oid) => serde_json::json!({ "$oid": oid.to_hex() }),
            DocId::Num(n) => Value::from(*n),
            DocId::Str(s) => Value::String(s.clone()),
        }
    }
}

fn looks_like_object_id(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        DocId::Str(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        DocId::Str(s)
    }
}

impl From<i64> for DocId {
    fn from(n: i64) -> Self {
        DocId::Num(n)
    }
}

impl From<ObjectId> for DocId {
    fn from(oid: ObjectId) -> Self {
        DocId::ObjectId(oid)
    }
}

impl From<DocId> for Value {
    fn from(id: DocId) -> Self {
        id.to_value()
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stringify())
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.stringify())
    }
}

/// A unique identifier for a client connection.
///
/// UUID v4 format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Create a new random SessionId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_hex_roundtrip() {
        let oid = ObjectId::random();
        let hex = oid.to_hex();
        assert_eq!(hex.len(), 24);
        assert_eq!(hex.parse::<ObjectId>().unwrap(), oid);
    }

    #[test]
    fn object_id_rejects_bad_hex() {
        assert!("not-an-object-id".parse::<ObjectId>().is_err());
        assert!("zzzzzzzzzzzzzzzzzzzzzzzz".parse::<ObjectId>().is_err());
    }

    #[test]
    fn plain_strings_stringify_to_themselves() {
        assert_eq!(DocId::from("abc").stringify(), "abc");
        assert_eq!(DocId::from("").stringify(), "");
    }

    #[test]
    fn ambiguous_strings_are_escaped() {
        assert_eq!(DocId::from("-x").stringify(), "--x");
        assert_eq!(DocId::from("~1").stringify(), "-~1");
        assert_eq!(DocId::from("{a}").stringify(), "-{a}");
        let hexish = "0123456789abcdef01234567";
        assert_eq!(DocId::from(hexish).stringify(), format!("-{}", hexish));
    }

    #[test]
    fn numbers_stringify_with_tilde() {
        assert_eq!(DocId::Num(42).stringify(), "~42");
        assert_eq!(DocId::parse("~42"), DocId::Num(42));
        assert_eq!(DocId::Num(-7).stringify(), "~-7");
    }

    #[test]
    fn parse_inverts_stringify() {
        let ids = vec![
            DocId::from("plain"),
            DocId::from(""),
            DocId::from("-dash"),
            DocId::from("~tilde"),
            DocId::from("0123456789abcdef01234567"),
            DocId::Num(5),
            DocId::ObjectId(ObjectId::random()),
        ];
        for id in ids {
            assert_eq!(DocId::parse(&id.stringify()), id);
        }
    }

    #[test]
    fn separately_parsed_object_ids_are_equal() {
        let hex = "5f2b6d1e9a3c4b7d8e0f1a2b";
        let a = DocId::ObjectId(hex.parse().unwrap());
        let b = DocId::parse(hex);
        assert_eq!(a, b);
        assert_eq!(a.stringify(), b.stringify());
    }

    #[test]
    fn doc_id_json_forms() {
        let oid: ObjectId = "5f2b6d1e9a3c4b7d8e0f1a2b".parse().unwrap();
        let json = serde_json::to_string(&DocId::ObjectId(oid)).unwrap();
        assert_eq!(json, r#"{"$oid":"5f2b6d1e9a3c4b7d8e0f1a2b"}"#);
        let back: DocId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DocId::ObjectId(oid));

        let n: DocId = serde_json::from_str("7").unwrap();
        assert_eq!(n, DocId::Num(7));
        let s: DocId = serde_json::from_str("\"x\"").unwrap();
        assert_eq!(s, DocId::from("x"));
    }

    #[test]
    fn session_id_is_uuid_v4() {
        let id = SessionId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
        assert_ne!(SessionId::new(), id);
    }
}
