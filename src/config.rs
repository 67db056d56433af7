use alloy::primitives::{Address, U256};
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

/// Main configuration for the guard, loaded from YAML.
///
/// Environment variables referenced as `$VAR` or `${VAR}` in the file are
/// expanded into the raw text before parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub blockchain: BlockchainConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub per_user_overrides: HashMap<String, LimitsConfig>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

/// Blockchain connection configuration
#[derive(Clone, Deserialize)]
pub struct BlockchainConfig {
    /// WebSocket RPC URL (ws:// or wss://) — subscriptions require it
    pub rpc_url: String,
    /// Custody contract address, 0x-prefixed hex, checksum-tolerant
    pub contract_address: String,
    /// Guard signing key, 32-byte hex, 0x prefix optional
    pub private_key: String,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for BlockchainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockchainConfig")
            .field("rpc_url", &self.rpc_url)
            .field("contract_address", &self.contract_address)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Maps token contract addresses to their withdrawal rate limits.
pub type LimitsConfig = HashMap<String, LimitEntry>;

/// Rate limits for one token; both sides optional, decimal u256 strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitEntry {
    #[serde(default)]
    pub hourly: Option<String>,
    #[serde(default)]
    pub daily: Option<String>,
}

fn default_listen_addr() -> String {
    ":8080".to_string()
}

fn default_db_path() -> String {
    "nitewatch.db".to_string()
}

impl Config {
    /// Load, expand and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;

        let expanded = expand_env(&raw);

        let config: Config =
            serde_yaml::from_str(&expanded).wrap_err("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.blockchain.validate()?;

        if self.limits.is_empty() {
            return Err(eyre!("at least one token limit must be configured"));
        }
        validate_limits(&self.limits, "limits")?;

        for (user_addr, token_limits) in &self.per_user_overrides {
            if Address::from_str(user_addr).is_err() {
                return Err(eyre!(
                    "invalid user address in per_user_overrides: {}",
                    user_addr
                ));
            }
            validate_limits(token_limits, &format!("per_user_overrides[{}]", user_addr))?;
        }

        Ok(())
    }

    /// The health endpoint socket address. A bare `:port` binds all
    /// interfaces.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        let addr = if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        };
        addr.parse()
            .wrap_err_with(|| format!("invalid listen_addr: {}", self.listen_addr))
    }
}

impl BlockchainConfig {
    fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            return Err(eyre!("missing blockchain RPC URL"));
        }
        if !self.rpc_url.starts_with("ws://") && !self.rpc_url.starts_with("wss://") {
            return Err(eyre!(
                "RPC URL must use WebSocket (ws:// or wss://), got: {}",
                self.rpc_url
            ));
        }
        if Address::from_str(&self.contract_address).is_err() {
            return Err(eyre!("invalid contract address: {}", self.contract_address));
        }
        let key = self.private_key.strip_prefix("0x").unwrap_or(&self.private_key);
        match hex::decode(key) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => return Err(eyre!("private key must be 32 bytes of hex")),
        }
        Ok(())
    }

    /// The custody contract address as a typed value. Callers should have
    /// validated the config first.
    pub fn contract_address(&self) -> Result<Address> {
        Address::from_str(&self.contract_address)
            .map_err(|_| eyre!("invalid contract address: {}", self.contract_address))
    }
}

fn validate_limits(limits: &LimitsConfig, section: &str) -> Result<()> {
    for (addr, entry) in limits {
        if Address::from_str(addr).is_err() {
            return Err(eyre!("invalid token address in {}: {}", section, addr));
        }
        for (side, value) in [("hourly", &entry.hourly), ("daily", &entry.daily)] {
            if let Some(v) = value {
                if U256::from_str_radix(v, 10).is_err() {
                    return Err(eyre!(
                        "invalid {} limit for {} in {}: {}",
                        side,
                        addr,
                        section,
                        v
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Expand `$VAR` and `${VAR}` references against the process environment.
/// Unset variables expand to the empty string.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    // Unterminated ${ — keep the literal text.
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    out
}
