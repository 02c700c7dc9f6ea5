//! Process-wide collaborator services
//!
//! The source system kept the metadata store and logging as global mutable
//! singletons; here they are explicit handles constructed once at startup
//! and passed into the builder, so tests can run stacks side by side.

use crate::config::ServiceConfig;

pub mod metadata;

pub use metadata::{MetadataError, MetadataResult, MetadataService};

/// Handle bundle passed to the builder and to layer factories.
#[derive(Default)]
pub struct Services {
    metadata: Option<MetadataService>,
}

impl Services {
    /// Services with nothing configured.
    pub fn none() -> Self {
        Self::default()
    }

    /// Construct services from the optional `[services]` config table.
    pub fn from_config(config: Option<&ServiceConfig>) -> MetadataResult<Self> {
        let metadata = match config {
            Some(ServiceConfig::Metadata {
                path,
                cache_size,
                threads,
            }) => Some(MetadataService::open(path, *cache_size, *threads)?),
            None => None,
        };
        Ok(Services { metadata })
    }

    /// The metadata service, when configured.
    pub fn metadata(&self) -> Option<&MetadataService> {
        self.metadata.as_ref()
    }

    /// Flush and close every configured service.
    pub fn close(&self) {
        if let Some(md) = &self.metadata {
            md.close();
        }
    }
}
