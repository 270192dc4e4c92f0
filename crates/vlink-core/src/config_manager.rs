//! Live configuration with change notification and hot reload.
//!
//! [`ConfigManager`] keeps the current [`LinkConfig`] behind an
//! [`ArcSwap`], so readers never block. Changes made through
//! [`update`](ConfigManager::update), [`reload`](ConfigManager::reload) or the
//! file watcher replace the whole snapshot and are reported to every
//! registered callback as an `(old, new)` pair.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, LinkConfig};
use crate::error::Result;

/// Called with the previous and the new configuration after every change.
pub type ChangeCallback = Box<dyn Fn(&LinkConfig, &LinkConfig) -> Result<()> + Send + Sync>;

/// Owns the configuration file and the current configuration.
pub struct ConfigManager {
    path: PathBuf,
    current: ArcSwap<LinkConfig>,
    callbacks: RwLock<Vec<ChangeCallback>>,
    write_lock: Mutex<()>,
}

impl ConfigManager {
    /// Loads `path` (creating it with defaults if missing) and validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, parsed or validated.
    pub fn open(path: impl Into<PathBuf>) -> std::result::Result<Arc<Self>, ConfigError> {
        let path = path.into();
        let config = LinkConfig::load_or_create(&path)?;
        config.validate()?;
        Ok(Arc::new(Self::with_config(path, config)))
    }

    /// Wraps an already loaded configuration. Nothing is read from or written
    /// to `path` until [`update`](Self::update) or [`reload`](Self::reload).
    #[must_use]
    pub fn with_config(path: impl Into<PathBuf>, config: LinkConfig) -> Self {
        Self {
            path: path.into(),
            current: ArcSwap::from_pointee(config),
            callbacks: RwLock::new(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> Arc<LinkConfig> {
        self.current.load_full()
    }

    /// Registers a change callback. Callback errors are logged and never
    /// undo a change.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&LinkConfig, &LinkConfig) -> Result<()> + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(callback));
    }

    /// Applies `mutator` to a copy of the configuration, validates and saves
    /// it, then makes it current.
    ///
    /// # Errors
    ///
    /// Returns the validation or save error; the current configuration is left
    /// untouched.
    pub fn update<F>(&self, mutator: F) -> std::result::Result<Arc<LinkConfig>, ConfigError>
    where
        F: FnOnce(&mut LinkConfig),
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let old = self.current.load_full();
        let mut next = (*old).clone();
        mutator(&mut next);
        next.validate()?;
        next.save(&self.path)?;

        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        info!(path = %self.path.display(), "configuration updated");
        self.notify(&old, &next);
        Ok(next)
    }

    /// Re-reads the file and replaces the current configuration wholesale.
    ///
    /// # Errors
    ///
    /// Returns the load or validation error; the current configuration is
    /// left untouched.
    pub fn reload(&self) -> std::result::Result<Arc<LinkConfig>, ConfigError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let next = LinkConfig::load(&self.path)?;
        next.validate()?;

        let old = self.current.load_full();
        if *old == next {
            debug!("configuration unchanged on reload");
            return Ok(old);
        }

        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        info!(path = %self.path.display(), "configuration reloaded");
        self.notify(&old, &next);
        Ok(next)
    }

    fn notify(&self, old: &LinkConfig, new: &LinkConfig) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for callback in callbacks.iter() {
            if let Err(err) = callback(old, new) {
                warn!(error = %err, "config change callback failed");
            }
        }
    }

    /// Reloads whenever the file is written or recreated.
    ///
    /// The parent directory is watched so editors that replace the file are
    /// noticed. A failed reload keeps the current configuration. Watching
    /// stops when the returned [`ConfigWatch`] is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Watch`] if the watcher cannot be started.
    pub fn watch(self: &Arc<Self>) -> std::result::Result<ConfigWatch, ConfigError> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let file_name = self.path.file_name().map(ToOwned::to_owned);
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == file_name.as_deref());
                    if !ours {
                        return;
                    }
                    let Some(manager) = manager.upgrade() else {
                        return;
                    };
                    if let Err(err) = manager.reload() {
                        error!(error = %err, "failed to reload config, keeping current configuration");
                    }
                }
                Err(err) => error!(error = %err, "config watch error"),
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        info!(path = %self.path.display(), "config watcher started");
        Ok(ConfigWatch { _watcher: watcher })
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("path", &self.path)
            .field("current", &*self.current.load_full())
            .finish_non_exhaustive()
    }
}

/// Keeps a config file watch alive.
pub struct ConfigWatch {
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for ConfigWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatch").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::LinkError;

    const VIN: &str = "5YJ3E1EA4KF000001";

    fn write_config(path: &Path, max_retries: u32) {
        let mut config = LinkConfig::default();
        config.vehicle.vin = VIN.into();
        config.retry.max_retries = max_retries;
        config.save(path).unwrap();
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let err = ConfigManager::open(&path).unwrap_err();

        assert!(matches!(err, ConfigError::Validation { field: "vehicle.vin", .. }));
        assert!(path.exists());
    }

    #[test]
    fn test_update_saves_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_config(&path, 3);
        let manager = ConfigManager::open(&path).unwrap();

        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        manager.on_change(move |old, new| {
            assert_eq!(old.retry.max_retries, 3);
            counter.store(new.retry.max_retries, Ordering::SeqCst);
            Ok(())
        });

        manager.update(|c| c.retry.max_retries = 9).unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 9);
        assert_eq!(manager.config().retry.max_retries, 9);
        assert_eq!(LinkConfig::load(&path).unwrap().retry.max_retries, 9);
    }

    #[test]
    fn test_invalid_update_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_config(&path, 3);
        let manager = ConfigManager::open(&path).unwrap();

        let result = manager.update(|c| c.vehicle.vin = "bad".into());

        assert!(result.is_err());
        assert_eq!(manager.config().vehicle.vin, VIN);
        assert_eq!(LinkConfig::load(&path).unwrap().vehicle.vin, VIN);
    }

    #[test]
    fn test_callback_errors_do_not_abort_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_config(&path, 3);
        let manager = ConfigManager::open(&path).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        manager.on_change(|_, _| Err(LinkError::Config("rejected".into())));
        let counter = Arc::clone(&calls);
        manager.on_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.update(|c| c.retry.max_retries = 1).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.config().retry.max_retries, 1);
    }

    #[test]
    fn test_reload_replaces_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_config(&path, 3);
        let manager = ConfigManager::open(&path).unwrap();

        write_config(&path, 6);
        let reloaded = manager.reload().unwrap();

        assert_eq!(reloaded.retry.max_retries, 6);
        assert_eq!(manager.config().retry.max_retries, 6);
    }

    #[test]
    fn test_failed_reload_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_config(&path, 3);
        let manager = ConfigManager::open(&path).unwrap();

        std::fs::write(&path, "[vehicle]\nvin = \"nope\"\n").unwrap();

        assert!(manager.reload().is_err());
        assert_eq!(manager.config().vehicle.vin, VIN);
    }

    #[test]
    fn test_watch_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_config(&path, 3);
        let manager = ConfigManager::open(&path).unwrap();

        let watch = manager.watch().unwrap();
        drop(watch);

        assert_eq!(manager.config().retry.max_retries, 3);
    }
}
