use std::{fmt, sync::Arc};

use tokio::sync::RwLock;
use zeroize::Zeroize;

/// Short-lived bearer token. Wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<CredentialBytes>);

#[derive(PartialEq, Eq)]
struct CredentialBytes(String);

impl Drop for CredentialBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(CredentialBytes(token.into())))
    }

    pub fn expose(&self) -> &str {
        &self.0 .0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Sole owner of the in-memory credential. Values are swapped wholesale.
#[derive(Debug, Default)]
pub struct TokenStore {
    current: RwLock<Option<Credential>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<Credential> {
        self.current.read().await.clone()
    }

    /// Stores `credential`, returning the one it replaced.
    pub async fn replace(&self, credential: Credential) -> Option<Credential> {
        self.current.write().await.replace(credential)
    }

    pub async fn clear(&self) -> Option<Credential> {
        self.current.write().await.take()
    }

    pub async fn is_present(&self) -> bool {
        self.current.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replace_swaps_whole_value() {
        let store = TokenStore::new();
        assert!(store.replace(Credential::new("first")).await.is_none());

        let previous = store.replace(Credential::new("second")).await;
        assert_eq!(previous.map(|c| c.expose().to_string()).as_deref(), Some("first"));
        assert_eq!(store.current().await, Some(Credential::new("second")));
    }

    #[tokio::test]
    async fn clear_empties_store() {
        let store = TokenStore::new();
        store.replace(Credential::new("t")).await;
        store.clear().await;
        assert!(!store.is_present().await);
    }

    #[test]
    fn debug_output_is_redacted() {
        let rendered = format!("{:?}", Credential::new("super-secret"));
        assert!(!rendered.contains("super-secret"));
    }
}
