//! # tabsync
//!
//! Exposes relational tables as authenticated, filterable sources and keeps
//! an external analytics platform in sync with rows inserted through the push
//! API or an MQTT feed.
//!
//! ## Components
//!
//! - **Filter compiler** ([`filter`]): untrusted JSON filter trees are bounded
//!   (depth 4, 16 children per node) and compiled to parameterized SQL
//! - **Type coercion** ([`coerce`]): raw values become typed values per field
//! - **Source registry** ([`registry`]): configured tables, credentials and
//!   per-source queues
//! - **Query executor** ([`query`]): cursor-streamed queries, counts and
//!   nominal-value lookups
//! - **Ingestion pipeline** ([`ingest`]): persist, queue, and forward with
//!   retry until acknowledged
//! - **Triggers** ([`mqtt`]): pub/sub messages routed to sources
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tabsync::prelude::*;
//!
//! let config = TabsyncConfig::from_file("tabsync.yaml")?;
//! let db = Database::connect_postgres(&config.database).await?;
//! let service = SyncService::from_config(&config, db)?;
//! service.start();
//!
//! service.push("pk", "sk", &[serde_json::json!({"a": 5, "b": "x"})]).await?;
//! let matching = service
//!     .count("pk", "sk", Some(&serde_json::json!({"operation": "eq", "left": 0, "right": "5"})))
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cli;
pub mod coerce;
pub mod config;
pub mod db;
pub mod error;
pub mod field;
pub mod filter;
pub mod forward;
pub mod ingest;
pub mod mqtt;
pub mod query;
pub mod registry;
pub mod service;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        DatabaseSettings, FieldSettings, ForwardSettings, MqttSettings, SensitiveString,
        SourceSettings, TabsyncConfig,
    };
    pub use crate::db::Database;
    pub use crate::error::{Error, Result};
    pub use crate::field::{Field, FieldType, Instance};
    pub use crate::filter::{CompiledCondition, FilterKind, FilterTree, Operation};
    pub use crate::forward::{Forwarder, HttpForwarder};
    pub use crate::ingest::{IngestPipeline, IngestSettings, IngestState, IngestStats};
    pub use crate::mqtt::{MessageDispatcher, MqttTrigger, RouteOutcome, TopicRouter};
    pub use crate::query::{QueryExecutor, QueryRequest, SortDirection};
    pub use crate::registry::{Source, SourceRegistry};
    pub use crate::service::SyncService;
}

pub use cli::Cli;
pub use error::{Error, Result};
pub use service::SyncService;
