// Coordinator configuration
// Thin typed wrapper over the config crate with defaults for every key

use std::path::PathBuf;
use std::time::Duration;

use taro_api::model::{
    DEFAULT_EVENT_QUEUE_SIZE, DEFAULT_RECONNECT_GRACE_MS, DEFAULT_WAIT_TIMEOUT_MS,
};

/// Coordinator configuration with typed accessors
#[derive(Clone, Debug)]
pub struct Configuration {
    config: config::Config,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            config: config::Config::default(),
        }
    }
}

impl Configuration {
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    /// Grace window a disconnected node has to reconnect before it is
    /// treated as LEFT
    pub fn reconnect_grace(&self) -> Duration {
        let ms = self
            .config
            .get_int("taro.reconnect.grace.ms")
            .map(|v| v.max(0) as u64)
            .unwrap_or(DEFAULT_RECONNECT_GRACE_MS);
        Duration::from_millis(ms)
    }

    /// Default timeout applied to wait calls that pass no explicit bound
    pub fn default_wait_timeout(&self) -> Duration {
        let ms = self
            .config
            .get_int("taro.wait.timeout.ms")
            .map(|v| v.max(0) as u64)
            .unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
        Duration::from_millis(ms)
    }

    /// Capacity of the topology event broadcast channel
    pub fn event_queue_size(&self) -> usize {
        self.config
            .get_int("taro.event.queue.size")
            .map(|v| v.max(1) as usize)
            .unwrap_or(DEFAULT_EVENT_QUEUE_SIZE)
    }

    /// Snapshot file the coordinator persists its durable state to;
    /// None disables persistence
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.config
            .get_string("taro.snapshot.path")
            .ok()
            .map(PathBuf::from)
    }
}

/// Builder-style helper for tests and embedded use
#[derive(Clone, Debug, Default)]
pub struct ConfigurationBuilder {
    reconnect_grace_ms: Option<u64>,
    wait_timeout_ms: Option<u64>,
    event_queue_size: Option<usize>,
    snapshot_path: Option<String>,
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconnect_grace_ms(mut self, ms: u64) -> Self {
        self.reconnect_grace_ms = Some(ms);
        self
    }

    pub fn wait_timeout_ms(mut self, ms: u64) -> Self {
        self.wait_timeout_ms = Some(ms);
        self
    }

    pub fn event_queue_size(mut self, size: usize) -> Self {
        self.event_queue_size = Some(size);
        self
    }

    pub fn snapshot_path(mut self, path: impl Into<String>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn build(self) -> anyhow::Result<Configuration> {
        let mut builder = config::Config::builder();
        if let Some(ms) = self.reconnect_grace_ms {
            builder = builder.set_override("taro.reconnect.grace.ms", ms as i64)?;
        }
        if let Some(ms) = self.wait_timeout_ms {
            builder = builder.set_override("taro.wait.timeout.ms", ms as i64)?;
        }
        if let Some(size) = self.event_queue_size {
            builder = builder.set_override("taro.event.queue.size", size as i64)?;
        }
        if let Some(path) = self.snapshot_path {
            builder = builder.set_override("taro.snapshot.path", path)?;
        }
        Ok(Configuration {
            config: builder.build()?,
        })
    }
}
