//! Access descriptors: the `vless://` URI a client imports.

use crate::models::Node;

/// Transport parameters shared by every descriptor in a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorProfile {
    pub sni: String,
    pub fingerprint: String,
}

impl Default for DescriptorProfile {
    fn default() -> Self {
        Self {
            sni: "www.microsoft.com".to_string(),
            fingerprint: "chrome".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialFabricator {
    profile: DescriptorProfile,
}

impl CredentialFabricator {
    pub fn new(profile: DescriptorProfile) -> Self {
        Self { profile }
    }

    /// Pure: same inputs always give the same string.
    pub fn fabricate(&self, client_id: &str, node: &Node, label: &str) -> String {
        format!(
            "vless://{id}@{host}:{port}?encryption=none&flow=xtls-rprx-vision&security=reality\
             &sni={sni}&fp={fp}&pbk={pbk}&type=tcp&headerType=none#{label}",
            id = client_id,
            host = uri_host(&node.address),
            port = node.port,
            sni = self.profile.sni,
            fp = self.profile.fingerprint,
            pbk = node.public_key,
            label = urlencoding::encode(label),
        )
    }
}

fn uri_host(address: &str) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{}]", address)
    } else {
        address.to_string()
    }
}
