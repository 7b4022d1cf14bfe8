//! Credential lookup interface

use crate::context::SyncContext;
use async_trait::async_trait;

/// Trait for secret store implementations
///
/// # Key Resolution
///
/// - `key` given: return that entry, or [`crate::Error::SecretRead`] if missing
/// - `key` absent and the secret has exactly one entry: return that entry
/// - otherwise: [`crate::Error::SecretRead`]
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn get_secret(
        &self,
        ctx: &SyncContext,
        namespace: &str,
        name: &str,
        key: Option<&str>,
    ) -> Result<String, crate::Error>;
}

/// Apply the key-resolution rule to a secret's entries
pub(crate) fn select_entry<I>(
    namespace: &str,
    name: &str,
    key: Option<&str>,
    mut entries: I,
) -> Result<String, crate::Error>
where
    I: Iterator<Item = (String, String)>,
{
    match key {
        Some(key) => entries
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or_else(|| {
                crate::Error::secret_read(format!(
                    "key '{key}' not found in secret {namespace}/{name}"
                ))
            }),
        None => {
            let first = entries.next();
            match (first, entries.next()) {
                (Some((_, value)), None) => Ok(value),
                (None, _) => Err(crate::Error::secret_read(format!(
                    "secret {namespace}/{name} has no entries"
                ))),
                (Some(_), Some(_)) => Err(crate::Error::secret_read(format!(
                    "secret {namespace}/{name} has several entries and no key was given"
                ))),
            }
        }
    }
}
