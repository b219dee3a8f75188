//! Accounts file parser
//!
//! Parses INI-style files with one optional [Engine] section and any number
//! of [Account] sections.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::context::{EngineConfig, UserState};
use crate::crypto::Ed25519KeyPair;
use crate::error::ConfigError;
use crate::policy::{Policy, PolicyTable};

/// Complete harness configuration
#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    /// Engine tunables
    pub engine: EngineConfig,
    /// Local accounts
    pub accounts: Vec<AccountConfig>,
}

/// One local account
#[derive(Clone)]
pub struct AccountConfig {
    /// Account name, e.g. "oneeyedian"
    pub name: String,
    /// Host protocol tag, e.g. "prpl-oscar"
    pub protocol: String,
    /// Ed25519 seed; a fresh key is generated when absent
    pub private_key: Option<[u8; 32]>,
    pub policy: Policy,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("private_key", &self.private_key.map(|_| "<redacted>"))
            .field("policy", &self.policy)
            .finish()
    }
}

impl HarnessConfig {
    /// Parse a configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut engine = EngineConfig::default();
        let mut accounts: Vec<AccountConfig> = Vec::new();
        let mut current_section: Option<Section> = None;
        let mut current_account: Option<AccountBuilder> = None;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.eq_ignore_ascii_case("[engine]") {
                if let Some(account) = current_account.take() {
                    push_account(&mut accounts, account.build()?)?;
                }
                current_section = Some(Section::Engine);
                continue;
            } else if line.eq_ignore_ascii_case("[account]") {
                if let Some(account) = current_account.take() {
                    push_account(&mut accounts, account.build()?)?;
                }
                current_section = Some(Section::Account);
                current_account = Some(AccountBuilder::default());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match current_section {
                Some(Section::Engine) => match key.as_str() {
                    "handshaketimeout" => {
                        engine.handshake_timeout = parse_seconds(value, line_num, "HandshakeTimeout")?;
                    }
                    "previouskeygrace" => {
                        engine.previous_key_grace = parse_seconds(value, line_num, "PreviousKeyGrace")?;
                    }
                    _ => {
                        tracing::debug!("Unknown engine key: {}", key);
                    }
                },
                Some(Section::Account) => {
                    let account = current_account.as_mut().ok_or(ConfigError::ParseError {
                        line: line_num,
                        message: "Account value outside of [Account] section".to_string(),
                    })?;

                    match key.as_str() {
                        "name" => account.name = Some(value.to_string()),
                        "protocol" => account.protocol = Some(value.to_string()),
                        "privatekey" => {
                            account.private_key = Some(parse_key(value, "PrivateKey")?);
                        }
                        "policy" => account.policy = Some(value.parse()?),
                        _ => {
                            tracing::debug!("Unknown account key: {}", key);
                        }
                    }
                }
                None => {
                    return Err(ConfigError::ParseError {
                        line: line_num,
                        message: "Configuration value outside of any section".to_string(),
                    });
                }
            }
        }

        if let Some(account) = current_account.take() {
            push_account(&mut accounts, account.build()?)?;
        }

        Ok(HarnessConfig { engine, accounts })
    }

    /// Policy table for the configured accounts
    pub fn policy_table(&self) -> PolicyTable {
        let mut table = PolicyTable::new(Policy::DEFAULT);
        for account in &self.accounts {
            table.set(account.name.clone(), account.policy);
        }
        table
    }

    /// Register every account's long-term key with `user_state`
    pub fn install_keys(&self, user_state: &UserState) {
        for account in &self.accounts {
            match &account.private_key {
                Some(seed) => user_state.add_key(
                    account.name.clone(),
                    account.protocol.clone(),
                    Arc::new(Ed25519KeyPair::from_seed(seed)),
                ),
                None => {
                    user_state.generate_key(account.name.clone(), account.protocol.clone());
                }
            }
        }
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }
}

/// Section type during parsing
#[derive(Clone, Copy)]
enum Section {
    Engine,
    Account,
}

/// Builder for AccountConfig during parsing
#[derive(Default)]
struct AccountBuilder {
    name: Option<String>,
    protocol: Option<String>,
    private_key: Option<[u8; 32]>,
    policy: Option<Policy>,
}

impl AccountBuilder {
    fn build(self) -> Result<AccountConfig, ConfigError> {
        let name = self.name.ok_or(ConfigError::MissingField {
            field: "Name in [Account]".to_string(),
        })?;
        let protocol = self.protocol.ok_or(ConfigError::MissingField {
            field: "Protocol in [Account]".to_string(),
        })?;

        Ok(AccountConfig {
            name,
            protocol,
            private_key: self.private_key,
            policy: self.policy.unwrap_or_default(),
        })
    }
}

fn push_account(accounts: &mut Vec<AccountConfig>, account: AccountConfig) -> Result<(), ConfigError> {
    if accounts
        .iter()
        .any(|a| a.name == account.name && a.protocol == account.protocol)
    {
        return Err(ConfigError::DuplicateAccount {
            account: account.name,
        });
    }
    accounts.push(account);
    Ok(())
}

/// Parse a base64-encoded 32-byte key
fn parse_key(value: &str, field_name: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|_| ConfigError::InvalidKey {
            field: field_name.to_string(),
        })?;

    if bytes.len() != 32 {
        return Err(ConfigError::InvalidKey {
            field: field_name.to_string(),
        });
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn parse_seconds(value: &str, line: usize, field: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::ParseError {
            line,
            message: format!("Invalid {}: {}", field, value),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::crypto::LongTermKey;
    use crate::policy::PolicyEvaluator;

    const TEST_CONFIG: &str = r#"
# harness accounts
[Engine]
HandshakeTimeout = 30
PreviousKeyGrace = 90

[Account]
Name = oneeyedian
Protocol = prpl-oscar
PrivateKey = UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=
Policy = allow-v2, auto-initiate

[Account]
Name = otr4ian
Protocol = prpl-oscar
Policy = opportunistic
"#;

    #[test]
    fn test_parse_config() {
        let config = HarnessConfig::parse(TEST_CONFIG).unwrap();

        assert_eq!(config.engine.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.previous_key_grace, Duration::from_secs(90));
        assert_eq!(config.accounts.len(), 2);

        let alice = config.account("oneeyedian").unwrap();
        assert_eq!(alice.protocol, "prpl-oscar");
        assert!(alice.private_key.is_some());
        assert_eq!(alice.policy, Policy::ALLOW_V2 | Policy::AUTO_INITIATE);

        let bob = config.account("otr4ian").unwrap();
        assert!(bob.private_key.is_none());
        assert_eq!(bob.policy, Policy::OPPORTUNISTIC);
    }

    #[test]
    fn test_policy_table() {
        let config = HarnessConfig::parse(TEST_CONFIG).unwrap();
        let table = config.policy_table();

        assert!(!table.policy("oneeyedian").contains(Policy::ALLOW_V1));
        assert_eq!(table.policy("somebody-else"), Policy::DEFAULT);
    }

    #[test]
    fn test_install_keys() {
        let config = HarnessConfig::parse(TEST_CONFIG).unwrap();
        let us = UserState::new();
        config.install_keys(&us);

        let seed = config.account("oneeyedian").unwrap().private_key.unwrap();
        let alice = us.key_for("oneeyedian", "prpl-oscar").unwrap();
        assert_eq!(alice.public_key(), Ed25519KeyPair::from_seed(&seed).public_key());
        assert!(us.key_for("otr4ian", "prpl-oscar").is_some());
    }

    #[test]
    fn test_defaults_without_engine_section() {
        let config = HarnessConfig::parse("[Account]\nName = a\nProtocol = p\n").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.accounts[0].policy, Policy::DEFAULT);
    }

    #[test]
    fn test_invalid_key() {
        assert!(parse_key("invalid-base64!", "TestKey").is_err());
        assert!(parse_key("dG9vIHNob3J0", "TestKey").is_err()); // "too short"
    }

    #[test]
    fn test_missing_name() {
        let result = HarnessConfig::parse("[Account]\nProtocol = prpl-oscar\n");
        assert!(matches!(result, Err(ConfigError::MissingField { .. })));
    }

    #[test]
    fn test_duplicate_account() {
        let content = "[Account]\nName = a\nProtocol = p\n[Account]\nName = a\nProtocol = p\n";
        assert!(matches!(
            HarnessConfig::parse(content),
            Err(ConfigError::DuplicateAccount { .. })
        ));
    }

    #[test]
    fn test_bad_policy_and_timeout() {
        let content = "[Account]\nName = a\nProtocol = p\nPolicy = allow-v7\n";
        assert!(matches!(
            HarnessConfig::parse(content),
            Err(ConfigError::InvalidPolicy { .. })
        ));

        let content = "[Engine]\nHandshakeTimeout = soon\n";
        assert!(matches!(
            HarnessConfig::parse(content),
            Err(ConfigError::ParseError { line: 2, .. })
        ));
    }

    #[test]
    fn test_value_outside_section() {
        let result = HarnessConfig::parse("Name = a\n");
        assert!(matches!(result, Err(ConfigError::ParseError { line: 1, .. })));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TEST_CONFIG.as_bytes()).unwrap();

        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config.accounts.len(), 2);

        let missing = HarnessConfig::from_file("/nonexistent/offrecord.conf");
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }
}
