//! Credential lookup used by the login handshake.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Answers "is this username/password pair valid?".
///
/// The relay never stores or mutates credentials; it only asks.
pub trait CredentialProvider: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;

    /// Every username this provider knows about. Seeds the presence table.
    fn known_users(&self) -> Vec<String>;
}

#[derive(Debug, Deserialize)]
struct Account {
    username: String,
    password: String,
}

/// Fixed in-memory username/password table.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    /// The built-in demo accounts.
    pub fn reference() -> Self {
        let users = [
            ("alice", "pass123"),
            ("bob", "pass456"),
            ("charlie", "pass789"),
            ("diana", "pass101"),
            ("eve", "pass202"),
        ]
        .into_iter()
        .map(|(user, password)| (user.to_string(), password.to_string()))
        .collect();
        Self { users }
    }

    /// Loads a JSON array of `{"username": ..., "password": ...}` records.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read users file {}", path.display()))?;
        let accounts: Vec<Account> = serde_json::from_str(&raw)
            .with_context(|| format!("users file {} is not a list of accounts", path.display()))?;

        let mut users = HashMap::with_capacity(accounts.len());
        for Account { username, password } in accounts {
            if users.contains_key(&username) {
                bail!("users file {} lists {username:?} twice", path.display());
            }
            users.insert(username, password);
        }
        Ok(Self { users })
    }
}

impl CredentialProvider for StaticCredentials {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|stored| stored == password)
    }

    fn known_users(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn reference_table_matches_exact_pairs() {
        let creds = StaticCredentials::reference();
        assert!(creds.authenticate("alice", "pass123"));
        assert!(creds.authenticate("eve", "pass202"));
        assert!(!creds.authenticate("alice", "pass456"));
        assert!(!creds.authenticate("mallory", "pass123"));
    }

    #[test]
    fn usernames_are_not_normalized() {
        let creds = StaticCredentials::reference();
        assert!(!creds.authenticate("Alice", "pass123"));
        assert!(!creds.authenticate(" alice", "pass123"));
        assert!(!creds.authenticate("alice", "pass123 "));
        assert!(!creds.authenticate("", ""));
    }

    #[test]
    fn loads_users_from_json() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"[{{"username": "zoe", "password": "secret"}}, {{"username": "yan", "password": "hunter2"}}]"#
        )
        .expect("write users");

        let creds = StaticCredentials::from_json_file(file.path()).expect("parse users");
        assert!(creds.authenticate("zoe", "secret"));
        assert!(!creds.authenticate("alice", "pass123"));

        let mut known = creds.known_users();
        known.sort();
        assert_eq!(known, vec!["yan".to_string(), "zoe".to_string()]);
    }

    #[test]
    fn rejects_malformed_users_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "[1, 2, 3]").expect("write users");
        assert!(StaticCredentials::from_json_file(file.path()).is_err());
    }

    #[test]
    fn rejects_duplicate_usernames() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"[{{"username": "zoe", "password": "a"}}, {{"username": "zoe", "password": "b"}}]"#
        )
        .expect("write users");
        let err = StaticCredentials::from_json_file(file.path()).expect_err("duplicate");
        assert!(err.to_string().contains("twice"));
    }
}
