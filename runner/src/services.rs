use crate::{
    config::GridConfig, database::SharedConnection, grid::GridClient, importer::DatasetImporter,
    provenance::VersionSource,
};
use gridin_ingest::OutputInspector;

/// The external systems the bookkeeping workflows talk to
pub struct Services<'a> {
    pub config: &'a GridConfig,
    pub connection: &'a SharedConnection,
    pub client: &'a dyn GridClient,
    pub inspector: &'a dyn OutputInspector,
    pub importer: &'a dyn DatasetImporter,
    pub versions: &'a dyn VersionSource,
    // decides how output files are reached, see StorageConfig::prefix_for_host
    pub hostname: String,
    // recorded as the author of every sample written
    pub author: String,
}

impl Services<'_> {
    pub fn storage_prefix(&self) -> &str {
        self.config.storage.prefix_for_host(&self.hostname)
    }
}
