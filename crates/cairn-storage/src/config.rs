use cairn_bundle::{BundleCompressionFormat, BundleFormat, BundleVersion};
use cairn_cache::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Configuration of a storage client and the defaults for its writers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Byte threshold at which a writer cuts a batch into a bundle.
    pub max_blob_size: u64,
    /// Raw bundle version writers produce; selects the V1 or V2 pipeline.
    pub max_version: u8,
    /// Codec for newly written packets.
    pub compression: BundleCompressionFormat,
    /// An open packet is closed once it holds at least this many bytes.
    pub min_packet_size: usize,
    /// Queued but unwritten bytes above which `write_node` flushes.
    pub max_queue_bytes: u64,
    /// Concurrent backend reads per client.
    pub max_concurrent_reads: usize,
    /// Bytes fetched up front when loading a header.
    pub header_read_size: usize,
    /// Path hint passed to the backend for new bundles.
    pub blob_prefix: String,
    pub cache: CacheConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_blob_size: 1024 * 1024,
            max_version: BundleVersion::LATEST.as_u8(),
            compression: BundleCompressionFormat::Lz4,
            min_packet_size: 64 * 1024,
            max_queue_bytes: 64 * 1024 * 1024,
            max_concurrent_reads: 16,
            header_read_size: 1024 * 1024,
            blob_prefix: "bundles".into(),
            cache: CacheConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> StorageResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.max_concurrent_reads == 0 {
            return Err(StorageError::Config(
                "max_concurrent_reads must be at least 1".into(),
            ));
        }
        self.writer_defaults().resolve(self).map(|_| ())
    }

    /// Writer options carrying no overrides.
    pub fn writer_defaults(&self) -> WriterOptions {
        WriterOptions::default()
    }
}

/// Per-writer overrides of [`StorageConfig`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    pub max_blob_size: Option<u64>,
    pub max_version: Option<u8>,
    pub compression: Option<BundleCompressionFormat>,
    pub min_packet_size: Option<usize>,
    pub max_queue_bytes: Option<u64>,
}

impl WriterOptions {
    pub fn with_max_blob_size(mut self, bytes: u64) -> Self {
        self.max_blob_size = Some(bytes);
        self
    }

    pub fn with_max_version(mut self, version: u8) -> Self {
        self.max_version = Some(version);
        self
    }

    pub fn with_compression(mut self, format: BundleCompressionFormat) -> Self {
        self.compression = Some(format);
        self
    }

    pub fn with_min_packet_size(mut self, bytes: usize) -> Self {
        self.min_packet_size = Some(bytes);
        self
    }

    pub fn with_max_queue_bytes(mut self, bytes: u64) -> Self {
        self.max_queue_bytes = Some(bytes);
        self
    }

    /// Merge with the client configuration and check the result is writable.
    pub(crate) fn resolve(&self, config: &StorageConfig) -> StorageResult<ResolvedOptions> {
        let max_version = self.max_version.unwrap_or(config.max_version);
        let format = BundleFormat::for_max_version(max_version).map_err(|_| {
            StorageError::Config(format!("unsupported bundle version {max_version}"))
        })?;
        let compression = self.compression.unwrap_or(config.compression);
        if !compression.is_supported() {
            return Err(StorageError::Config(format!(
                "compression format {compression} cannot be written"
            )));
        }
        let min_packet_size = self.min_packet_size.unwrap_or(config.min_packet_size);
        if min_packet_size == 0 {
            return Err(StorageError::Config(
                "min_packet_size must be at least 1".into(),
            ));
        }
        Ok(ResolvedOptions {
            format,
            compression,
            max_blob_size: self.max_blob_size.unwrap_or(config.max_blob_size).max(1),
            min_packet_size,
            max_queue_bytes: self.max_queue_bytes.unwrap_or(config.max_queue_bytes),
            blob_prefix: config.blob_prefix.clone(),
        })
    }
}

/// Writer settings after overrides are applied.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedOptions {
    pub format: BundleFormat,
    pub compression: BundleCompressionFormat,
    pub max_blob_size: u64,
    pub min_packet_size: usize,
    pub max_queue_bytes: u64,
    pub blob_prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.max_blob_size, 1 << 20);
        assert_eq!(config.max_version, 5);
        assert_eq!(config.compression, BundleCompressionFormat::Lz4);
        assert_eq!(config.min_packet_size, 64 * 1024);
        assert_eq!(config.max_queue_bytes, 64 << 20);
        assert_eq!(config.max_concurrent_reads, 16);
        assert_eq!(config.header_read_size, 1 << 20);
        assert_eq!(config.blob_prefix, "bundles");
        assert_eq!(config.cache, CacheConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = StorageConfig::from_toml_str(
            r#"
            max_version = 4
            compression = "zstd"

            [cache]
            page_count = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.max_version, 4);
        assert_eq!(config.compression, BundleCompressionFormat::Zstd);
        assert_eq!(config.cache.page_count, 0);
        assert_eq!(config.cache.reader_count, CacheConfig::default().reader_count);
        assert_eq!(config.max_blob_size, StorageConfig::default().max_blob_size);
    }

    #[test]
    fn invalid_settings_are_config_errors() {
        for source in [
            "max_version = 9",
            "compression = \"oodle\"",
            "max_concurrent_reads = 0",
            "min_packet_size = 0",
            "max_blob_size = \"big\"",
        ] {
            let err = StorageConfig::from_toml_str(source).unwrap_err();
            assert!(matches!(err, StorageError::Config(_)), "{source}: {err}");
        }
    }

    #[test]
    fn writer_overrides_select_the_pipeline() {
        let config = StorageConfig::default();
        let resolved = WriterOptions::default().resolve(&config).unwrap();
        assert_eq!(resolved.format, BundleFormat::V2);
        assert_eq!(resolved.max_blob_size, config.max_blob_size);

        let resolved = WriterOptions::default()
            .with_max_version(BundleVersion::RemoveAliases.as_u8())
            .with_compression(BundleCompressionFormat::Gzip)
            .with_max_blob_size(2048)
            .resolve(&config)
            .unwrap();
        assert_eq!(resolved.format, BundleFormat::V1(BundleVersion::RemoveAliases));
        assert_eq!(resolved.compression, BundleCompressionFormat::Gzip);
        assert_eq!(resolved.max_blob_size, 2048);

        let err = WriterOptions::default()
            .with_max_version(6)
            .resolve(&config)
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));

        let err = WriterOptions::default()
            .with_min_packet_size(0)
            .resolve(&config)
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
