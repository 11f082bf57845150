//! Requests and responses that travel along the chain.
//!
//! A [`Request`] enters the chain at the head (updates) or the tail (queries).
//! Its `id` is assigned by whoever created it and is reused unchanged by every
//! node, by the matching [`Response`] and by the transport acknowledgments.

use serde::{Deserialize, Serialize};

/// Operation carried by a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    Update {
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub key: String,
    #[serde(flatten)]
    pub kind: RequestKind,
}

impl Request {
    pub fn update(id: impl Into<String>, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            kind: RequestKind::Update {
                value: value.into(),
            },
        }
    }

    pub fn query(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            kind: RequestKind::Query,
        }
    }

    pub fn is_update(&self) -> bool {
        matches!(self.kind, RequestKind::Update { .. })
    }
}

/// Outcome of a request.
///
/// For updates `value` echoes the written value; for queries it is the stored
/// value, or `None` when the key is unknown to the tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt_bytes")]
    pub value: Option<Vec<u8>>,
}

impl Response {
    pub fn new(id: impl Into<String>, key: impl Into<String>, value: Option<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            value,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|encoded| STANDARD.decode(encoded).map_err(D::Error::custom))
            .transpose()
    }
}
