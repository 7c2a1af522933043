use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use zeroize::Zeroize;

/// A connection credential.
///
/// The text is wiped when the value is dropped and is never printed; `Debug` shows a short fingerprint instead, which
/// is enough to tell two credentials apart in logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(secret: S) -> Self {
        Secret(secret.into())
    }

    /// The raw credential, for handing to the transport.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first 4 bytes of the blake2s digest of the credential, hex encoded.
    pub fn fingerprint(&self) -> String {
        let digest = Blake2s256::digest(self.0.as_bytes());
        hex::encode(&digest[..4])
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({})", self.fingerprint())
    }
}

impl From<&str> for Secret {
    fn from(secret: &str) -> Self {
        Secret::new(secret)
    }
}

impl From<String> for Secret {
    fn from(secret: String) -> Self {
        Secret::new(secret)
    }
}
