//! Boot configuration
//!
//! Boot-time settings load from environment variables (prefix `FAZT_`) over
//! defaults, highest precedence first. Everything that can change without a
//! restart lives in the `configurations` table instead (see
//! [`crate::db::config_store`]).

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;

/// Boot-time configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    /// SQLite database path (`--db` flag / `FAZT_DB_PATH`)
    pub db_path: PathBuf,

    /// Listen address
    pub listen: String,

    /// Root domain apps hang off of, e.g. `example.dev`
    pub root_domain: String,

    /// Optional fixed admin token (`FAZT_ADMIN_TOKEN`) accepted as a
    /// bearer credential with owner role
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Private CIDR ranges trusted to set X-Forwarded-For
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,

    /// Directory for large-upload spill files; system temp when unset
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data.db"),
            listen: "0.0.0.0:8080".to_string(),
            root_domain: "localhost".to_string(),
            admin_token: None,
            trusted_proxies: default_trusted_proxies(),
            temp_dir: None,
        }
    }
}

fn default_trusted_proxies() -> Vec<String> {
    vec!["127.0.0.0/8".to_string(), "10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()]
}

impl BootConfig {
    /// Load from environment over defaults.
    pub fn load() -> Result<Self> {
        let config = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("FAZT_"))
            .extract()?;
        Ok(config)
    }

    /// Load with an explicit DB path taking precedence (the `--db` flag).
    pub fn load_with_db(db: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::load()?;
        if let Some(path) = db {
            config.db_path = path;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BootConfig::default();
        assert_eq!(config.db_path, PathBuf::from("./data.db"));
        assert!(config.admin_token.is_none());
        assert!(!config.trusted_proxies.is_empty());
    }

    #[test]
    fn test_flag_overrides_env() {
        let config = BootConfig::load_with_db(Some(PathBuf::from("/tmp/x.db"))).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
    }
}
