use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One `settings.clients[]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntry {
    pub id: String,
    pub flow: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("config is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),
    #[error("no inbound with protocol '{0}'")]
    MissingInbound(String),
    #[error("inbound '{0}' has no settings.clients array")]
    MissingClients(String),
}

/// A node's proxy config held as an untyped tree.
///
/// Only the client list of the first matching inbound is ever touched; everything
/// else (including key order) round-trips as read.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    root: Value,
    protocol: String,
}

impl ConfigDocument {
    pub fn parse(bytes: &[u8], protocol: &str) -> Result<Self, DocumentError> {
        let root: Value = serde_json::from_slice(bytes)?;
        let mut doc = Self {
            root,
            protocol: protocol.to_string(),
        };
        // Reject wrong shapes up front so nothing downstream writes a half-understood file.
        doc.clients_mut()?;
        Ok(doc)
    }

    fn inbound(&self) -> Option<&Value> {
        self.root
            .get("inbounds")?
            .as_array()?
            .iter()
            .find(|inbound| inbound.get("protocol").and_then(Value::as_str) == Some(self.protocol.as_str()))
    }

    fn clients(&self) -> Result<&Vec<Value>, DocumentError> {
        let inbound = self
            .inbound()
            .ok_or_else(|| DocumentError::MissingInbound(self.protocol.clone()))?;
        inbound
            .get("settings")
            .and_then(|s| s.get("clients"))
            .and_then(Value::as_array)
            .ok_or_else(|| DocumentError::MissingClients(self.protocol.clone()))
    }

    fn clients_mut(&mut self) -> Result<&mut Vec<Value>, DocumentError> {
        let protocol = self.protocol.clone();
        let inbound = self
            .root
            .get_mut("inbounds")
            .and_then(Value::as_array_mut)
            .and_then(|inbounds| {
                inbounds
                    .iter_mut()
                    .find(|i| i.get("protocol").and_then(Value::as_str) == Some(protocol.as_str()))
            })
            .ok_or_else(|| DocumentError::MissingInbound(protocol.clone()))?;
        inbound
            .get_mut("settings")
            .and_then(|s| s.get_mut("clients"))
            .and_then(Value::as_array_mut)
            .ok_or(DocumentError::MissingClients(protocol))
    }

    /// Ids of every client on the matched inbound, in document order.
    pub fn client_ids(&self) -> Vec<String> {
        self.clients()
            .map(|clients| {
                clients
                    .iter()
                    .filter_map(|c| c.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients()
            .map(|clients| clients.iter().any(|c| entry_id(c) == Some(client_id)))
            .unwrap_or(false)
    }

    /// Append the entry. Returns `false` when the id is already present.
    pub fn add_client(&mut self, entry: &ClientEntry) -> Result<bool, DocumentError> {
        if self.contains(&entry.id) {
            return Ok(false);
        }
        let value = serde_json::to_value(entry)?;
        self.clients_mut()?.push(value);
        Ok(true)
    }

    /// Drop every entry with this id. Returns `false` when none was present.
    pub fn remove_client(&mut self, client_id: &str) -> Result<bool, DocumentError> {
        let clients = self.clients_mut()?;
        let before = clients.len();
        clients.retain(|c| entry_id(c) != Some(client_id));
        Ok(clients.len() != before)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        let mut out = serde_json::to_vec_pretty(&self.root)?;
        out.push(b'\n');
        Ok(out)
    }
}

fn entry_id(entry: &Value) -> Option<&str> {
    entry.get("id").and_then(Value::as_str)
}
