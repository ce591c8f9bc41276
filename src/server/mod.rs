// Wires the registry, pool and refractor together behind one HTTP listener.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::pool::Pool;
use crate::provider::fixed::FixedProvider;
use crate::provider::traits::MirrorProvider;
use crate::refract::handler::{self, Refractor};
use crate::stats::ThroughputRegistry;

pub struct Server {
    pool: Arc<Pool>,
    refractor: Arc<Refractor>,
    cancel: CancellationToken,
}

impl Server {
    /// Build a server using the fixed mirror list from the configuration.
    pub fn new(config: Config) -> Self {
        let provider: Arc<dyn MirrorProvider> =
            Arc::new(FixedProvider::new(config.mirrors.clone()));
        Self::with_provider(config, provider)
    }

    /// Build a server around any mirror provider.
    pub fn with_provider(config: Config, provider: Arc<dyn MirrorProvider>) -> Self {
        let config = config.with_defaults();
        let registry = Arc::new(ThroughputRegistry::new(config.ranking.clone()));
        let pool = Arc::new(Pool::new(
            config.ranking.workers,
            config.upstream.clone(),
            provider,
            registry,
        ));
        let refractor = Arc::new(Refractor::new(&config.refract, Arc::clone(&pool)));

        Self {
            pool,
            refractor,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the pool and the listener.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn refractor(&self) -> &Arc<Refractor> {
        &self.refractor
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Serve until the cancellation token fires.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let pool = Arc::clone(&self.pool);
        let pool_cancel = self.cancel.clone();
        tokio::spawn(async move {
            pool.start(pool_cancel).await;
        });

        let address = listener.local_addr().context("reading listener address")?;
        info!("listening on {address}");

        let app = handler::router(Arc::clone(&self.refractor));
        let cancel = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("serving HTTP")?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
