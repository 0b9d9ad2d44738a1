//! # Session Builder
//!
//! Provides a fluent API for configuring a session before it starts pumping.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::schema::RecordSchema;
use crate::schema::Schema;
use crate::session::Session;
use crate::transport::Transport;
use crate::value::IntoValue;
use crate::value::Value;

/// Fluent builder for a `Session`.
pub struct SessionBuilder {
    transport: Arc<dyn Transport>,
    root: Value,
    config: SessionConfig,
    schemas: Vec<RecordSchema>,
}

impl SessionBuilder {
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Arc::new(transport),
            root: Value::Null,
            config: SessionConfig::default(),
            schemas: Vec::new(),
        }
    }

    /// The value the peer receives from `remote_root`.
    pub fn root(mut self, root: impl IntoValue) -> Self {
        self.root = root.into_value();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Blocking calls wait for their reply however long it takes.
    pub fn no_timeout(mut self) -> Self {
        self.config.call_timeout = None;
        self
    }

    pub fn release_high_water(mut self, mark: u32) -> Self {
        self.config.release_high_water = mark;
        self
    }

    /// Registers a record schema by description.
    pub fn record(mut self, schema: RecordSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Registers the record schema of `T`.
    pub fn schema<T: Schema>(self) -> Self {
        self.record(T::schema())
    }

    /// Replaces every setting at once.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts the session. Must be called within a tokio runtime.
    pub fn open(self) -> Session {
        Session::start(self.transport, self.root, self.config, self.schemas)
    }
}
