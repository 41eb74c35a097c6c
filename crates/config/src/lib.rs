//! Configuration for lazyblob.
//!
//! Values are layered, later layers winning:
//! 1. built-in defaults
//! 2. an optional configuration file (TOML, JSON or YAML, picked by extension)
//! 3. `LAZYBLOB_`-prefixed environment variables, with `__` separating
//!    nested keys (`LAZYBLOB_READER__PREFETCH_WORKERS=8`)
//!
//! ```toml
//! [reader]
//! prefetch_workers = 4
//! cache_workers = 8
//! max_walk_depth = 100
//!
//! [cache]
//! kind = "directory"
//! path = "/var/cache/lazyblob"
//! ```

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use lazyblob_cache::{CacheHandle, DirectoryCache, MemoryCache};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ENV_PREFIX: &str = "LAZYBLOB_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub reader: ReaderConfig,
    pub cache: CacheConfig,
}

/// Tuning for the read engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaderConfig {
    /// Workers used to fetch the missing chunks of a single large read.
    /// `1` disables batched prefetching.
    pub prefetch_workers: usize,
    /// Workers used by whole-archive background caching.
    pub cache_workers: usize,
    /// Deepest directory nesting that background caching will descend into.
    pub max_walk_depth: usize,
}
impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            prefetch_workers: 4,
            cache_workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
            max_walk_depth: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Memory,
    Directory,
}

/// Which chunk cache to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub kind: CacheKind,
    /// Root of a directory cache. Defaults to the platform cache directory.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from defaults, an optional file, and the environment.
    ///
    /// # Errors
    ///
    /// [`NotFound`](ErrorKind::NotFound) if `file` is given but doesn't exist,
    /// [`Invalid`](ErrorKind::Invalid) if any layer fails to parse or the
    /// merged values don't validate.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            if !file.is_file() {
                exn::bail!(ErrorKind::NotFound(file.to_path_buf()));
            }
            figment = match file.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                _ => exn::bail!(ErrorKind::Invalid(format!(
                    "unrecognised configuration format: {}",
                    file.display()
                ))),
            };
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        let config: Config = figment.extract().map_err(|e| ErrorKind::Invalid(e.to_string()))?;
        config.validate()?;
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// Check values that deserialize fine but can't be used.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("reader.prefetch_workers", self.reader.prefetch_workers),
            ("reader.cache_workers", self.reader.cache_workers),
            ("reader.max_walk_depth", self.reader.max_walk_depth),
        ] {
            if value == 0 {
                exn::bail!(ErrorKind::Invalid(format!("{name} must be at least 1")));
            }
        }
        if let Some(path) = &self.cache.path
            && !path.is_absolute()
        {
            exn::bail!(ErrorKind::Invalid(format!("cache.path must be absolute: {}", path.display())));
        }
        Ok(())
    }
}

impl CacheConfig {
    /// Directory a directory cache will use.
    pub fn directory(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        match ProjectDirs::from("", "", "lazyblob") {
            Some(dirs) => Ok(dirs.cache_dir().to_path_buf()),
            None => exn::bail!(ErrorKind::Invalid(
                "cache.path is unset and no platform cache directory is available".to_string()
            )),
        }
    }

    /// Create the configured cache.
    pub fn build(&self) -> Result<CacheHandle> {
        match self.kind {
            CacheKind::Memory => Ok(Arc::new(MemoryCache::default())),
            CacheKind::Directory => {
                let root = self.directory()?;
                tracing::info!(root = %root.display(), "Using directory cache");
                let cache = DirectoryCache::new("directory", &root).or_raise(|| ErrorKind::Cache)?;
                Ok(Arc::new(cache))
            },
        }
    }
}
