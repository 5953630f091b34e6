//! Client identity resolution.

use serde::{Deserialize, Serialize};

/// The unit of rate accounting and banning.
///
/// Anonymous callers are keyed by network address; authenticated callers
/// are keyed by their API credential and get larger budgets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ClientIdentity {
    /// Network address of an anonymous caller
    Address(String),
    /// API identity of an authenticated caller
    ApiKey(String),
}

impl ClientIdentity {
    /// Identity for an anonymous caller.
    pub fn address(addr: impl Into<String>) -> Self {
        ClientIdentity::Address(addr.into())
    }

    /// Identity for a caller authenticated by API key.
    pub fn api_key(key: impl Into<String>) -> Self {
        ClientIdentity::ApiKey(key.into())
    }

    /// Build an identity from its wire form.
    pub fn resolve(value: &str, authenticated: bool) -> Self {
        if authenticated {
            Self::api_key(value)
        } else {
            Self::address(value)
        }
    }

    /// Whether this caller is keyed by API identity.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, ClientIdentity::ApiKey(_))
    }

    /// The raw address or key, without the kind prefix.
    pub fn value(&self) -> &str {
        match self {
            ClientIdentity::Address(v) | ClientIdentity::ApiKey(v) => v,
        }
    }

    /// Convert the identity to the string used as a storage key.
    pub fn to_string_key(&self) -> String {
        match self {
            ClientIdentity::Address(addr) => addr.clone(),
            ClientIdentity::ApiKey(key) => format!("key:{}", key),
        }
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_anonymous() {
        let id = ClientIdentity::resolve("1.2.3.4", false);
        assert_eq!(id, ClientIdentity::Address("1.2.3.4".to_string()));
        assert!(!id.is_authenticated());
        assert_eq!(id.to_string(), "1.2.3.4");
    }

    #[test]
    fn test_resolve_authenticated() {
        let id = ClientIdentity::resolve("tenant-a", true);
        assert!(id.is_authenticated());
        assert_eq!(id.value(), "tenant-a");
        assert_eq!(id.to_string_key(), "key:tenant-a");
    }

    #[test]
    fn test_same_value_different_kind_not_equal() {
        let addr = ClientIdentity::address("abc");
        let key = ClientIdentity::api_key("abc");
        assert_ne!(addr, key);
        assert_ne!(addr.to_string_key(), key.to_string_key());
    }
}
