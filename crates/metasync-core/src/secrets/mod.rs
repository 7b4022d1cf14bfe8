// # Secret Readers
//
// Implementations of the SecretReader trait.
//
// - `MemorySecretReader`: secrets held in memory (tests, embedding)
// - `DirectorySecretReader`: mounted secrets laid out as
//   `<root>/<namespace>/<name>/<key>`, one file per entry
//
// Both apply the same key-resolution rule: an explicit key must exist, and
// an absent key is only allowed when the secret has exactly one entry.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

use crate::Error;
use crate::context::SyncContext;
use crate::traits::SecretReader;
use crate::traits::secrets::select_entry;

/// In-memory secret store
#[derive(Clone, Default)]
pub struct MemorySecretReader {
    secrets: Arc<RwLock<HashMap<(String, String), BTreeMap<String, String>>>>,
}

impl std::fmt::Debug for MemorySecretReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySecretReader")
            .field("secrets", &"<redacted>")
            .finish()
    }
}

impl MemorySecretReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one entry of a secret
    pub async fn insert(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.secrets
            .write()
            .await
            .entry((namespace.into(), name.into()))
            .or_default()
            .insert(key.into(), value.into());
    }
}

#[async_trait]
impl SecretReader for MemorySecretReader {
    async fn get_secret(
        &self,
        _ctx: &SyncContext,
        namespace: &str,
        name: &str,
        key: Option<&str>,
    ) -> Result<String, Error> {
        let secrets = self.secrets.read().await;
        let entries = secrets
            .get(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::secret_read(format!("secret {namespace}/{name} not found")))?;
        select_entry(
            namespace,
            name,
            key,
            entries.iter().map(|(k, v)| (k.clone(), v.clone())),
        )
    }
}

/// Secrets mounted as files under a root directory
#[derive(Debug, Clone)]
pub struct DirectorySecretReader {
    root: PathBuf,
}

impl DirectorySecretReader {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn read_entries(&self, dir: &Path) -> Result<Vec<(String, String)>, Error> {
        let mut listing = fs::read_dir(dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = listing.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            // Mounted secrets carry `..data`-style bookkeeping entries
            if file_name.starts_with('.') {
                continue;
            }
            // Mounted keys are symlinks into `..data/`; follow them
            let path = entry.path();
            match fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => {}
                _ => continue,
            }
            let value = fs::read_to_string(&path).await?;
            entries.push((file_name, value.trim_end().to_string()));
        }
        entries.sort();
        Ok(entries)
    }
}

#[async_trait]
impl SecretReader for DirectorySecretReader {
    async fn get_secret(
        &self,
        ctx: &SyncContext,
        namespace: &str,
        name: &str,
        key: Option<&str>,
    ) -> Result<String, Error> {
        let dir = self.root.join(namespace).join(name);
        if !dir.is_dir() {
            return Err(Error::secret_read(format!("secret {namespace}/{name} not found")));
        }

        let entries = ctx
            .run(async {
                self.read_entries(&dir).await.map_err(|e| {
                    Error::secret_read(format!("secret {namespace}/{name}: {e}"))
                })
            })
            .await?;
        select_entry(namespace, name, key, entries.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn single_entry_is_used_without_key() {
        let reader = MemorySecretReader::new();
        reader.insert("ns", "gh", "token", "abc").await;
        let ctx = SyncContext::background();

        assert_eq!(reader.get_secret(&ctx, "ns", "gh", None).await.unwrap(), "abc");
        assert_eq!(
            reader.get_secret(&ctx, "ns", "gh", Some("token")).await.unwrap(),
            "abc"
        );
    }

    #[tokio::test]
    async fn ambiguous_or_missing_entries_fail() {
        let reader = MemorySecretReader::new();
        reader.insert("ns", "cf", "token", "a").await;
        reader.insert("ns", "cf", "other", "b").await;
        let ctx = SyncContext::background();

        assert!(matches!(
            reader.get_secret(&ctx, "ns", "cf", None).await,
            Err(Error::SecretRead(_))
        ));
        assert!(matches!(
            reader.get_secret(&ctx, "ns", "cf", Some("missing")).await,
            Err(Error::SecretRead(_))
        ));
        assert!(matches!(
            reader.get_secret(&ctx, "ns", "nope", None).await,
            Err(Error::SecretRead(_))
        ));
    }

    #[tokio::test]
    async fn directory_layout() {
        let dir = tempdir().unwrap();
        let secret = dir.path().join("istio-system").join("cf");
        std::fs::create_dir_all(&secret).unwrap();
        std::fs::write(secret.join("apiToken"), "tok\n").unwrap();

        let reader = DirectorySecretReader::new(dir.path());
        let ctx = SyncContext::background();
        assert_eq!(
            reader.get_secret(&ctx, "istio-system", "cf", None).await.unwrap(),
            "tok"
        );

        std::fs::write(secret.join("second"), "x").unwrap();
        assert!(reader.get_secret(&ctx, "istio-system", "cf", None).await.is_err());
        assert_eq!(
            reader
                .get_secret(&ctx, "istio-system", "cf", Some("apiToken"))
                .await
                .unwrap(),
            "tok"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mounted_secret_symlinks_are_followed() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        let secret = dir.path().join("ns").join("cf");
        let data = secret.join("..2024_01_01_00_00_00.000000000");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("apiToken"), "tok\n").unwrap();
        symlink("..2024_01_01_00_00_00.000000000", secret.join("..data")).unwrap();
        symlink("..data/apiToken", secret.join("apiToken")).unwrap();
        symlink("..data/missing", secret.join("dangling")).unwrap();

        let reader = DirectorySecretReader::new(dir.path());
        let ctx = SyncContext::background();
        assert_eq!(
            reader.get_secret(&ctx, "ns", "cf", Some("apiToken")).await.unwrap(),
            "tok"
        );
        assert_eq!(reader.get_secret(&ctx, "ns", "cf", None).await.unwrap(), "tok");
    }
}
