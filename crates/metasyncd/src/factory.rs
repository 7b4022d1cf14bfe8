// Builds concrete sources and targets for the daemon
//
// Target kinds whose crate was compiled out fail at build time with an
// initialization error, which the engine records against that target only.

use metasync_core::traits::{ComponentFactory, RangeSource, RangeTarget};
use metasync_core::{Error, SourceConfig, SourceSettings, TargetConfig, TargetSettings};
use metasync_source_metadata::MetadataSource;

/// Factory for every kind this binary supports
#[derive(Debug, Clone, Copy)]
pub struct DaemonFactory {
    dry_run: bool,
}

impl DaemonFactory {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl ComponentFactory for DaemonFactory {
    fn build_source(&self, config: &SourceConfig) -> Result<Box<dyn RangeSource>, Error> {
        match &config.settings {
            SourceSettings::Metadata(_) => Ok(Box::new(MetadataSource::new(&config.name))),
        }
    }

    fn build_target(&self, config: &TargetConfig) -> Result<Box<dyn RangeTarget>, Error> {
        match &config.settings {
            #[cfg(feature = "cloudflare")]
            TargetSettings::Cloudflare(_) => Ok(Box::new(
                metasync_target_cloudflare::CloudflareTarget::new(&config.name, self.dry_run),
            )),
            #[cfg(not(feature = "cloudflare"))]
            TargetSettings::Cloudflare(_) => Err(Error::init(
                "cloudflare target support is not compiled into this binary",
            )),

            #[cfg(feature = "mesh")]
            TargetSettings::Mesh(_) => Ok(Box::new(metasync_target_mesh::MeshTarget::new(
                &config.name,
                self.dry_run,
            ))),
            #[cfg(not(feature = "mesh"))]
            TargetSettings::Mesh(_) => Err(Error::init(
                "mesh target support is not compiled into this binary",
            )),
        }
    }
}
