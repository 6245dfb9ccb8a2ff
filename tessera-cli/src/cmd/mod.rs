pub mod info;
pub mod run;
pub mod serve;
pub mod worker;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use anyhow::Result;
use tessera_core::{HubLoader, ResourceCache, WorkerConfig};

/// Resource cache over the Hub loader with every configured source registered.
pub fn resource_cache(config: &WorkerConfig) -> Result<Arc<ResourceCache>> {
    let device = tessera_core::default_device()?;
    let cache = ResourceCache::with_sources(
        Arc::new(HubLoader::new(device)),
        config.sources.iter().map(|(task, source)| (*task, source.clone())),
    );
    Ok(Arc::new(cache))
}
