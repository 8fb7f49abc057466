//! Source registry
//!
//! Sources are built once at startup and never change afterwards. Each one
//! owns its ingestion queue.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tabsync_rdbc::security::validate_sql_identifier;

use crate::error::{Error, Result};
use crate::field::{Field, FieldType};
use crate::ingest::SourceQueue;

/// A configured table exposed to the external platform
pub struct Source {
    table: String,
    public_key: String,
    secret_key: SecretString,
    topic: Option<String>,
    fields: Vec<Field>,
    queue: SourceQueue,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("table", &self.table)
            .field("public_key", &self.public_key)
            .field("secret_key", &"***")
            .field("topic", &self.topic)
            .field("fields", &self.fields)
            .finish()
    }
}

impl Source {
    /// Create a source. Field indices follow the order of `fields`.
    ///
    /// The table and every field name must be plain SQL identifiers, and
    /// field names must be unique.
    pub fn new(
        table: impl Into<String>,
        public_key: impl Into<String>,
        secret_key: impl Into<String>,
        topic: Option<String>,
        fields: Vec<(String, FieldType)>,
    ) -> Result<Self> {
        let table = table.into();
        validate_sql_identifier(&table)
            .map_err(|e| Error::config(format!("source table: {}", e)))?;

        if fields.is_empty() {
            return Err(Error::config(format!("source '{}' has no fields", table)));
        }

        let mut seen = HashSet::new();
        for (name, _) in &fields {
            validate_sql_identifier(name)
                .map_err(|e| Error::config(format!("source '{}' field: {}", table, e)))?;
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(Error::config(format!(
                    "source '{}' declares field '{}' twice",
                    table, name
                )));
            }
        }

        let public_key = public_key.into();
        if public_key.is_empty() {
            return Err(Error::config(format!("source '{}' has an empty public key", table)));
        }

        Ok(Self {
            table,
            public_key,
            secret_key: SecretString::from(secret_key.into()),
            topic: topic.filter(|t| !t.is_empty()),
            fields: fields
                .into_iter()
                .enumerate()
                .map(|(index, (name, ty))| Field::new(index, name, ty))
                .collect(),
            queue: SourceQueue::new(),
        })
    }

    /// Backing table name
    #[inline]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Public half of the credentials
    #[inline]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Secret half of the credentials
    #[inline]
    pub fn secret_key(&self) -> &SecretString {
        &self.secret_key
    }

    /// Inbound pub/sub topic, if any
    #[inline]
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Fields in index order
    #[inline]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Field at `index`, if it exists
    pub fn field(&self, index: i64) -> Option<&Field> {
        usize::try_from(index).ok().and_then(|i| self.fields.get(i))
    }

    /// Ingestion queue of this source
    #[inline]
    pub fn queue(&self) -> &SourceQueue {
        &self.queue
    }

    /// Compare credentials in constant time.
    ///
    /// Both halves are always compared so timing does not reveal which one
    /// differed.
    pub fn matches_credentials(&self, public_key: &str, secret_key: &str) -> bool {
        let public_ok = self.public_key.as_bytes().ct_eq(public_key.as_bytes());
        let secret_ok = self
            .secret_key
            .expose_secret()
            .as_bytes()
            .ct_eq(secret_key.as_bytes());
        (public_ok & secret_ok).into()
    }
}

/// The set of configured sources
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<Source>>,
}

impl SourceRegistry {
    /// Build a registry; public keys must be unique
    pub fn new(sources: Vec<Source>) -> Result<Self> {
        let mut keys = HashSet::new();
        for source in &sources {
            if !keys.insert(source.public_key.clone()) {
                return Err(Error::config(format!(
                    "public key of source '{}' is already used",
                    source.table
                )));
            }
        }
        Ok(Self {
            sources: sources.into_iter().map(Arc::new).collect(),
        })
    }

    /// Find the source matching the credentials.
    ///
    /// Every source is checked; the first match wins.
    pub fn authenticate(&self, public_key: &str, secret_key: &str) -> Result<Arc<Source>> {
        let mut found = None;
        for source in &self.sources {
            if source.matches_credentials(public_key, secret_key) && found.is_none() {
                found = Some(Arc::clone(source));
            }
        }
        found.ok_or(Error::Unauthorized)
    }

    /// Source subscribed to `topic`
    pub fn by_topic(&self, topic: &str) -> Option<Arc<Source>> {
        self.sources
            .iter()
            .find(|s| s.topic.as_deref() == Some(topic))
            .cloned()
    }

    /// Source identified by its public key
    pub fn by_public_key(&self, public_key: &str) -> Option<Arc<Source>> {
        self.sources
            .iter()
            .find(|s| s.public_key == public_key)
            .cloned()
    }

    /// All sources in configuration order
    #[inline]
    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    /// Topics of all sources that have one
    pub fn topics(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter_map(|s| s.topic.clone())
            .collect()
    }

    /// Number of sources
    #[inline]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no source is configured
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
