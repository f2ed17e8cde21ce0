use serde::{Deserialize, Serialize};

/// A client id already live on a node, waiting to be handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PoolEntry {
    pub id: i64,
    pub node_id: i64,
    pub client_id: String,
    pub label: String,
    pub is_used: bool,
}

/// One row of a pool import file.
///
/// Accepts the `{uuid, email}` shape emitted by older pool generators as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPoolEntry {
    #[serde(alias = "uuid")]
    pub client_id: String,
    #[serde(alias = "email")]
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_import_shape_deserializes() {
        let entry: NewPoolEntry =
            serde_json::from_str(r#"{"uuid": "abc", "email": "pool_0001"}"#).unwrap();
        assert_eq!(entry.client_id, "abc");
        assert_eq!(entry.label, "pool_0001");
    }
}
