use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::HiveConfig;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

struct CachedConfig {
    loaded_at: Instant,
    config: Arc<HiveConfig>,
}

/// Re-reads `hive.yaml` at most once per TTL. Owned by the process root and
/// handed to whoever needs configuration.
pub struct ConfigCache {
    path: PathBuf,
    ttl: Duration,
    entry: RwLock<Option<CachedConfig>>,
}

impl ConfigCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            entry: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Arc<HiveConfig> {
        self.get_at(Instant::now())
    }

    fn get_at(&self, now: Instant) -> Arc<HiveConfig> {
        if let Some(cached) = self.entry.read().as_ref() {
            if now.saturating_duration_since(cached.loaded_at) < self.ttl {
                return Arc::clone(&cached.config);
            }
        }

        let config = Arc::new(HiveConfig::load_or_default(&self.path));
        *self.entry.write() = Some(CachedConfig {
            loaded_at: now,
            config: Arc::clone(&config),
        });
        config
    }

    /// Drops the cached copy so the next `get` reads the file again.
    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }
}
