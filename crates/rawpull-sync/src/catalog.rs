//! Where tenant connections come from: a `tenants.yaml` file or the `tenant_connections` table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rawpull_core::{Credentials, TenantAccount};
use serde::Deserialize;
use sqlx::{PgPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait TenantCatalog: Send + Sync {
    /// Distinct platforms with at least one enabled connection.
    async fn platforms(&self) -> Result<Vec<String>, CatalogError>;

    /// Enabled connections for `platform`, ordered by `(tenant_id, account_id)`.
    async fn accounts_for_platform(&self, platform: &str) -> Result<Vec<TenantAccount>, CatalogError>;
}

#[derive(Debug, Clone, Deserialize)]
struct TenantsFile {
    #[serde(default)]
    tenants: Vec<TenantEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TenantEntry {
    tenant_id: i64,
    account_id: String,
    platform: String,
    #[serde(default)]
    credentials: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct YamlCatalog {
    accounts: Vec<TenantAccount>,
}

impl YamlCatalog {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw).map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, serde_yaml::Error> {
        let file: TenantsFile = serde_yaml::from_str(raw)?;
        let mut accounts = file
            .tenants
            .into_iter()
            .filter(|t| t.enabled)
            .map(|t| TenantAccount {
                tenant_id: t.tenant_id,
                account_id: t.account_id,
                platform: t.platform,
                credentials: Credentials::new(t.credentials),
            })
            .collect::<Vec<_>>();
        accounts.sort_by(|a, b| (a.tenant_id, &a.account_id).cmp(&(b.tenant_id, &b.account_id)));
        Ok(Self { accounts })
    }

    pub fn from_accounts(accounts: Vec<TenantAccount>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl TenantCatalog for YamlCatalog {
    async fn platforms(&self) -> Result<Vec<String>, CatalogError> {
        let mut platforms = self
            .accounts
            .iter()
            .map(|a| a.platform.clone())
            .collect::<Vec<_>>();
        platforms.sort();
        platforms.dedup();
        Ok(platforms)
    }

    async fn accounts_for_platform(&self, platform: &str) -> Result<Vec<TenantAccount>, CatalogError> {
        Ok(self
            .accounts
            .iter()
            .filter(|a| a.platform == platform)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantCatalog for PgCatalog {
    async fn platforms(&self) -> Result<Vec<String>, CatalogError> {
        let rows = sqlx::query(
            "SELECT DISTINCT platform FROM tenant_connections WHERE enabled ORDER BY platform",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("platform").map_err(CatalogError::from))
            .collect()
    }

    async fn accounts_for_platform(&self, platform: &str) -> Result<Vec<TenantAccount>, CatalogError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, account_id, platform, credentials
              FROM tenant_connections
             WHERE platform = $1 AND enabled
             ORDER BY tenant_id, account_id
            "#,
        )
        .bind(platform)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let credentials: sqlx::types::Json<BTreeMap<String, serde_json::Value>> =
                row.try_get("credentials")?;
            // Non-string credential values are kept in their JSON text form.
            let credentials = credentials
                .0
                .into_iter()
                .map(|(k, v)| match v {
                    serde_json::Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect();
            out.push(TenantAccount {
                tenant_id: row.try_get("tenant_id")?,
                account_id: row.try_get("account_id")?,
                platform: row.try_get("platform")?,
                credentials: Credentials::new(credentials),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TENANTS: &str = r#"
tenants:
  - tenant_id: 2
    account_id: b
    platform: survey
    credentials:
      access_token: secret
  - tenant_id: 1
    account_id: a
    platform: survey
  - tenant_id: 3
    account_id: c
    platform: survey
    enabled: false
  - tenant_id: 4
    account_id: d
    platform: ads
"#;

    #[tokio::test]
    async fn yaml_catalog_filters_disabled_and_other_platforms() {
        let catalog = YamlCatalog::from_yaml_str(TENANTS).unwrap();
        let accounts = catalog.accounts_for_platform("survey").await.unwrap();
        let ids = accounts.iter().map(|a| a.tenant_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(accounts[1].credentials.get("access_token"), Some("secret"));
        assert!(catalog.accounts_for_platform("unknown").await.unwrap().is_empty());
        assert_eq!(catalog.platforms().await.unwrap(), vec!["ads".to_string(), "survey".to_string()]);
    }

    #[tokio::test]
    async fn yaml_catalog_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TENANTS.as_bytes()).unwrap();
        let catalog = YamlCatalog::from_path(file.path()).unwrap();
        assert_eq!(catalog.accounts_for_platform("ads").await.unwrap().len(), 1);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = YamlCatalog::from_path("/definitely/not/here/tenants.yaml").unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let catalog = YamlCatalog::from_yaml_str(TENANTS).unwrap();
        let rendered = format!("{catalog:?}");
        assert!(!rendered.contains("secret"));
    }
}
