use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use url::Url;

/// The canonical key for a remote endpoint.
///
/// Built by trimming and lower-casing an address and keeping only its host (and an explicit, non-default port).
/// Two addresses name the same remote iff their keys are equal, so `wss://Node-A.example/` and `wss://node-a.example`
/// share a key. Text that does not parse as a URL (a bare host name such as `node-b.example`) is kept as-is, minus
/// any trailing `/`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn from_address(address: &str) -> Self {
        let normalized = address.trim().to_lowercase();
        let key = match Url::parse(&normalized) {
            Ok(url) => match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => fallback_key(&normalized),
            },
            Err(_) => fallback_key(&normalized),
        };
        IdentityKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn fallback_key(normalized: &str) -> String {
    normalized.trim_end_matches('/').to_string()
}

impl Display for IdentityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdentityKey {
    fn from(address: &str) -> Self {
        IdentityKey::from_address(address)
    }
}

/// The host name of an address, as shown on a connected status indicator. `None` if the address is not a URL.
pub fn display_host(address: &str) -> Option<String> {
    Url::parse(address.trim()).ok().and_then(|url| url.host_str().map(str::to_string))
}
