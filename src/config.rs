// Configuration loaded from a TOML file, with zero meaning "use the default".

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration for the proxy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP listener binds to.
    pub listen: String,
    /// Mirror URLs handed out by the fixed provider.
    pub mirrors: Vec<String>,
    pub ranking: RankingConfig,
    pub refract: RefractConfig,
    pub upstream: UpstreamConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config.with_defaults())
    }

    pub fn with_defaults(mut self) -> Self {
        if self.listen.is_empty() {
            self.listen = "0.0.0.0:8080".to_string();
        }
        self.ranking = self.ranking.with_defaults();
        self.refract = self.refract.with_defaults();
        self.upstream = self.upstream.with_defaults();
        self
    }
}

/// Worker count and the eviction thresholds used by the throughput ranking.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    /// Number of concurrent worker slots.
    pub workers: usize,
    /// Workers ranked above this position are safe from eviction.
    /// Zero means three quarters of `workers`.
    pub top_workers: usize,
    /// Absolute throughput floor, in MiB/s, above which a worker is never evicted.
    pub good_throughput_mibs: f64,
}

impl RankingConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.workers == 0 {
            self.workers = 12;
        }
        if self.top_workers == 0 {
            self.top_workers = self.workers * 3 / 4;
        }
        if self.good_throughput_mibs == 0.0 {
            self.good_throughput_mibs = 2.0;
        }
        self
    }

    pub fn good_throughput_bytes(&self) -> f64 {
        self.good_throughput_mibs * 1024.0 * 1024.0
    }
}

/// Chunking and retry behavior of the splitter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RefractConfig {
    /// Size of each ranged chunk, in MiB.
    pub chunk_size_mibs: u64,
    /// Per-attempt timeout for a single chunk request, in milliseconds.
    pub chunk_timeout_ms: u64,
    /// Attempts per chunk before the client request is failed.
    pub retries: u32,
}

impl RefractConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.chunk_size_mibs == 0 {
            self.chunk_size_mibs = 4;
        }
        if self.chunk_timeout_ms == 0 {
            self.chunk_timeout_ms = 3_000;
        }
        if self.retries == 0 {
            self.retries = 5;
        }
        self
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mibs << 20
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

/// Timeouts applied to every upstream client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Budget for everything that happens before bytes flow: connect,
    /// TLS, waiting for response headers, idle keep-alive. Seconds.
    pub pre_download_timeout_secs: u64,
    /// Budget for a whole request, body included. Seconds.
    pub download_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.pre_download_timeout_secs == 0 {
            self.pre_download_timeout_secs = 3;
        }
        if self.download_timeout_secs == 0 {
            self.download_timeout_secs = 120;
        }
        self
    }

    pub fn pre_download_timeout(&self) -> Duration {
        Duration::from_secs(self.pre_download_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
