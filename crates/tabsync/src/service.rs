//! Authenticated entry points
//!
//! Every operation takes the caller's `(public_key, secret_key)` pair and
//! resolves it to a source before doing anything else. A failed lookup is a
//! uniform [`crate::Error::Unauthorized`].

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::TabsyncConfig;
use crate::db::Database;
use crate::error::Result;
use crate::field::{Field, Instance};
use crate::filter::FilterTree;
use crate::forward::{Forwarder, HttpForwarder};
use crate::ingest::{IngestPipeline, IngestSettings, IngestStats};
use crate::mqtt::TopicRouter;
use crate::query::{QueryExecutor, QueryRequest};
use crate::registry::{Source, SourceRegistry};

/// Facade over the registry, query executor and ingestion pipeline
pub struct SyncService {
    registry: Arc<SourceRegistry>,
    db: Database,
    queries: QueryExecutor,
    pipeline: Arc<IngestPipeline>,
}

impl SyncService {
    /// Wire the components together. Workers start with [`SyncService::start`].
    pub fn new(
        registry: Arc<SourceRegistry>,
        db: Database,
        forwarder: Arc<dyn Forwarder>,
        settings: IngestSettings,
    ) -> Self {
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::clone(&registry),
            db.clone(),
            forwarder,
            settings,
        ));
        Self {
            registry,
            queries: QueryExecutor::new(db.clone()),
            db,
            pipeline,
        }
    }

    /// Build a service from configuration, forwarding over HTTP
    pub fn from_config(config: &TabsyncConfig, db: Database) -> Result<Self> {
        let registry = Arc::new(config.build_registry()?);
        let forwarder = Arc::new(HttpForwarder::from_settings(&config.forward)?);
        Ok(Self::new(
            registry,
            db,
            forwarder,
            IngestSettings::from(&config.forward),
        ))
    }

    /// Start the ingestion workers
    pub fn start(&self) {
        self.pipeline.start();
        info!(sources = self.registry.len(), "tabsync service started");
    }

    /// Configured sources
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Query executor
    pub fn queries(&self) -> &QueryExecutor {
        &self.queries
    }

    /// Ingestion pipeline
    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    /// Router for pub/sub messages
    pub fn topic_router(&self) -> TopicRouter {
        TopicRouter::new(Arc::clone(&self.pipeline))
    }

    fn authenticate(&self, public_key: &str, secret_key: &str) -> Result<Arc<Source>> {
        self.registry.authenticate(public_key, secret_key).map_err(|e| {
            warn!("rejected request with unknown credentials");
            e
        })
    }

    /// Schema of the caller's source
    pub fn describe(&self, public_key: &str, secret_key: &str) -> Result<Vec<Field>> {
        let source = self.authenticate(public_key, secret_key)?;
        Ok(source.fields().to_vec())
    }

    /// Stream rows of the caller's source
    pub async fn query<S, R>(
        &self,
        public_key: &str,
        secret_key: &str,
        request: &QueryRequest,
        on_schema: S,
        on_row: R,
    ) -> Result<u64>
    where
        S: FnOnce(&[Field]) + Send,
        R: FnMut(Instance) + Send,
    {
        let source = self.authenticate(public_key, secret_key)?;
        self.queries.query(&source, request, on_schema, on_row).await
    }

    /// Count rows matching a wire filter; a missing or malformed filter
    /// counts every row
    pub async fn count(
        &self,
        public_key: &str,
        secret_key: &str,
        filter: Option<&serde_json::Value>,
    ) -> Result<u64> {
        let source = self.authenticate(public_key, secret_key)?;
        let filter = FilterTree::from_wire(filter);
        self.queries.count(&source, filter.as_ref()).await
    }

    /// Distinct values of a nominal field
    pub async fn nominal_values(
        &self,
        public_key: &str,
        secret_key: &str,
        filter: Option<&serde_json::Value>,
        feature: i64,
        text_query: Option<&str>,
    ) -> Result<Vec<String>> {
        let source = self.authenticate(public_key, secret_key)?;
        let filter = FilterTree::from_wire(filter);
        self.queries
            .nominal_values(&source, filter.as_ref(), feature, text_query)
            .await
    }

    /// Persist and queue wire instances
    pub async fn push(
        &self,
        public_key: &str,
        secret_key: &str,
        objects: &[serde_json::Value],
    ) -> Result<usize> {
        let source = self.authenticate(public_key, secret_key)?;
        self.pipeline.push_wire(&source, objects).await
    }

    /// Request a forward pass without new rows
    pub fn notice_update(&self, public_key: &str, secret_key: &str) -> Result<()> {
        let source = self.authenticate(public_key, secret_key)?;
        self.pipeline.notice_update(&source);
        Ok(())
    }

    /// Ingestion statistics of the caller's source
    pub fn stats(&self, public_key: &str, secret_key: &str) -> Result<IngestStats> {
        let source = self.authenticate(public_key, secret_key)?;
        Ok(source.queue().stats())
    }

    /// Stop the workers, then close pooled connections
    pub async fn shutdown(&self) -> Result<()> {
        self.pipeline.shutdown().await;
        self.db.close().await.map_err(|e| {
            warn!(error = %e, "failed to close connection pool");
            e
        })?;
        info!("tabsync service stopped");
        Ok(())
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("sources", &self.registry.len())
            .finish()
    }
}
