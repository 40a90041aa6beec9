//! Configuration value types for the pieces surrounding this crate's core
//! components: connection settings, backup profiles, and retention policy
//! definitions that an (out-of-scope) CLI would load from TOML and hand to
//! the component constructors in `catalog`, `wal_streamer`, `base_backup`,
//! and `retention`.
//!
//! The only two *mandatory* process-wide inputs — the
//! catalog path and the archive path — are passed directly to constructors
//! and are deliberately not modeled as part of this file-loaded `Config`.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::retention::RetentionRule;

/// A connection's DSN or discrete host/port/user/database fields, matching
/// the `connections` table columns exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveConnectionConfig {
    pub dsn: Option<String>,
    pub pghost: Option<String>,
    pub pgport: Option<u16>,
    pub pguser: Option<String>,
    pub pgdatabase: Option<String>,
}

impl ArchiveConnectionConfig {
    /// Renders a libpq-style connection string, preferring an explicit DSN
    /// when one was configured.
    pub fn to_connect_string(&self) -> String {
        if let Some(dsn) = &self.dsn {
            return dsn.clone();
        }
        let mut parts = Vec::new();
        if let Some(h) = &self.pghost {
            parts.push(format!("host={h}"));
        }
        if let Some(p) = self.pgport {
            parts.push(format!("port={p}"));
        }
        if let Some(u) = &self.pguser {
            parts.push(format!("user={u}"));
        }
        if let Some(d) = &self.pgdatabase {
            parts.push(format!("dbname={d}"));
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    None,
    Gzip,
}

impl Default for CompressionKind {
    fn default() -> Self {
        CompressionKind::None
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ManifestChecksumAlgorithm {
    None,
    Sha224,
    Sha256,
}

/// Named bundle of options influencing a future `BASE_BACKUP`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupProfileConfig {
    pub name: String,
    #[serde(default)]
    pub compression: CompressionKind,
    pub max_rate_bytes_per_sec: Option<u64>,
    pub label_template: Option<String>,
    #[serde(default)]
    pub fast_checkpoint: bool,
    #[serde(default)]
    pub include_wal: bool,
    #[serde(default)]
    pub wait_for_wal: bool,
    #[serde(default)]
    pub verify_checksums: bool,
    #[serde(default)]
    pub manifest: bool,
    #[serde(default)]
    pub manifest_checksum_algorithm: Option<ManifestChecksumAlgorithm>,
}

/// A named ordered list of retention rules, as loaded from TOML, matching
/// the `retention`/`retention_rules` catalog tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicyConfig {
    pub name: String,
    pub rules: Vec<RetentionRule>,
}

/// Top-level configuration document, loaded from TOML with `toml_edit` by
/// the (out-of-scope) CLI and handed piecemeal to component constructors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub archives: Vec<ArchiveEntryConfig>,
    #[serde(default)]
    pub backup_profiles: Vec<BackupProfileConfig>,
    #[serde(default)]
    pub retention_policies: Vec<RetentionPolicyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntryConfig {
    pub name: String,
    pub directory: Utf8PathBuf,
    #[serde(default)]
    pub compression: CompressionKind,
    #[serde(default)]
    pub connection: ArchiveConnectionConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Config, toml_edit::de::Error> {
        toml_edit::de::from_str(s)
    }

    pub fn to_toml_string(&self) -> Result<String, toml_edit::ser::Error> {
        toml_edit::ser::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_config_prefers_explicit_dsn() {
        let cfg = ArchiveConnectionConfig {
            dsn: Some("postgresql://localhost/postgres".to_string()),
            pghost: Some("ignored".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.to_connect_string(), "postgresql://localhost/postgres");
    }

    #[test]
    fn connection_config_assembles_discrete_fields() {
        let cfg = ArchiveConnectionConfig {
            dsn: None,
            pghost: Some("db1".to_string()),
            pgport: Some(5432),
            pguser: Some("replicator".to_string()),
            pgdatabase: None,
        };
        assert_eq!(cfg.to_connect_string(), "host=db1 port=5432 user=replicator");
    }

    #[test]
    fn config_round_trips_through_toml() {
        let toml = r#"
            [[archives]]
            name = "main"
            directory = "/var/lib/pgarc/main"
            compression = "gzip"

            [[backup_profiles]]
            name = "nightly"
            wait_for_wal = true
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.archives.len(), 1);
        assert_eq!(cfg.archives[0].name, "main");
        assert_eq!(cfg.backup_profiles[0].name, "nightly");
        assert!(cfg.backup_profiles[0].wait_for_wal);
    }
}
