//! The key/envelope data model (spec §3).

use std::fmt;
use std::hash::Hash;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A pub/sub or RPC destination: either an anonymous, endpoint-allocated slot
/// used only for a single reply, or a user-chosen named key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key<K> {
    Anonymous(u64),
    Named(K),
}

impl<K: fmt::Display> fmt::Display for Key<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Anonymous(id) => write!(f, "#{id}"),
            Key::Named(k) => write!(f, "{k}"),
        }
    }
}

/// The bound a method/subscription name must satisfy to be used as a named
/// key. `Display` is required unconditionally: the original implementation
/// detects at compile time whether its key type supports `operator<<` and
/// renders the default-handler message with or without the key text
/// accordingly. Rust's trait system has no stable equivalent of that
/// conditional detection, so this crate requires `Display` up front instead —
/// any named key type the original could render, this crate can render too;
/// it just can't also accept key types that couldn't be rendered.
pub trait NamedKey:
    Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> NamedKey for T where
    T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_named_and_anonymous() {
        let named: Key<String> = Key::Named("greeting".to_string());
        assert_eq!(named.to_string(), "greeting");
        let anon: Key<String> = Key::Anonymous(7);
        assert_eq!(anon.to_string(), "#7");
    }

    #[test]
    fn distinct_anonymous_keys_are_not_equal() {
        let a: Key<String> = Key::Anonymous(1);
        let b: Key<String> = Key::Anonymous(2);
        assert_ne!(a, b);
    }
}
