//! In-memory holder for sensitive variable values.
//!
//! Values live in `Zeroizing<String>` so the backing storage is overwritten
//! before release, whether cleared explicitly or dropped with the session.
//! The store deliberately has no `Serialize` impl; persistence goes through
//! the non-sensitive snapshot in the project file, which never sees these
//! entries.

use std::collections::HashMap;
use std::fmt;
use zeroize::Zeroizing;

#[derive(Default)]
pub struct SecretStore {
    values: HashMap<String, Zeroizing<String>>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a secret. The name must already have passed
    /// `sanitizer::variable_name`.
    pub fn store(&mut self, name: &str, value: String) {
        self.values.insert(name.to_string(), Zeroizing::new(value));
    }

    pub fn retrieve(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.as_str())
    }

    pub fn clear_one(&mut self, name: &str) {
        // removal drops the Zeroizing wrapper, which overwrites the buffer
        self.values.remove(name);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.values().map(|v| v.as_str())
    }

    /// Name/value pairs for building `-var` tokens. The clones are
    /// transient by design: they go straight into an argument vector and
    /// the spawned child's argv.
    pub fn pairs(&self) -> Vec<(String, Zeroizing<String>)> {
        let mut pairs: Vec<(String, Zeroizing<String>)> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

// Never print values, even at trace level.
impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretStore({} entries)", self.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_retrieve_clear() {
        let mut store = SecretStore::new();
        store.store("db_password", "hunter2".to_string());
        store.store("api_key", "sk-123".to_string());
        assert_eq!(store.retrieve("db_password"), Some("hunter2"));
        assert_eq!(store.len(), 2);

        store.clear_one("db_password");
        assert_eq!(store.retrieve("db_password"), None);
        assert!(store.contains("api_key"));

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.retrieve("api_key"), None);
    }

    #[test]
    fn replace_overwrites() {
        let mut store = SecretStore::new();
        store.store("token", "old".to_string());
        store.store("token", "new".to_string());
        assert_eq!(store.retrieve("token"), Some("new"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn debug_never_prints_values() {
        let mut store = SecretStore::new();
        store.store("token", "super-secret".to_string());
        let rendered = format!("{store:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("1 entries"));
    }

    #[test]
    fn pairs_are_sorted_by_name() {
        let mut store = SecretStore::new();
        store.store("b", "2".to_string());
        store.store("a", "1".to_string());
        let pairs = store.pairs();
        assert_eq!(pairs[0].0, "a");
        assert_eq!(pairs[1].0, "b");
    }
}
