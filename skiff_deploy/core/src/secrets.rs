//! Flat `KEY=value` secret store, read-only to the engine.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    values: BTreeMap<String, String>,
}

impl SecretStore {
    /// Parses a secrets file. `#` comments and blank lines are ignored; values
    /// keep everything after the first `=`, including further `=` signs.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("secrets line {} is not KEY=value", lineno + 1);
            };
            let key = key.trim();
            if key.is_empty() {
                bail!("secrets line {} has an empty key", lineno + 1);
            }
            values.insert(key.to_owned(), value.to_owned());
        }
        Ok(Self { values })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secrets file {}", path.display()))?;
        Self::parse(&contents)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Resolves every key to its value; any missing key is an error naming it.
    pub fn resolve(&self, keys: &[String]) -> Result<Vec<(String, String)>> {
        let mut resolved = Vec::with_capacity(keys.len());
        for key in keys {
            match self.values.get(key) {
                Some(value) => resolved.push((key.clone(), value.clone())),
                None => bail!("secret key {key} is not present in the secrets file"),
            }
        }
        Ok(resolved)
    }

    /// Every secret value, for registering with a session's redaction list.
    pub fn all_values(&self) -> Vec<String> {
        self.values.values().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_comments_and_equals_in_values() {
        let store = SecretStore::parse(
            "# comment\n\nDB_PASSWORD=s3cr=et\nAPI_KEY=abc\n",
        )
        .unwrap();
        assert_eq!(store.get("DB_PASSWORD"), Some("s3cr=et"));
        assert_eq!(store.get("API_KEY"), Some("abc"));
        assert!(!store.contains("MISSING"));
    }

    #[test]
    fn missing_key_is_an_error_naming_the_key() {
        let store = SecretStore::parse("A=1\n").unwrap();
        let err = store.resolve(&["NOPE".to_owned()]).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(SecretStore::parse("JUSTAKEY\n").is_err());
        assert!(SecretStore::parse("=value\n").is_err());
    }
}
