//! Component Loader: hot deployment from a directory.
//!
//! The loader watches one components directory. Each bundle moves through
//! these states:
//!
//! ```text
//!             package dropped              record created
//!   Absent ─────────────────► Extracted ─────────────────► Loaded
//!     ▲          (extract)        ▲         (load + bind)     │
//!     │                           │                           │ package newer
//!     │                           └──── re-extract ◄──── Stale ◄┘ than directory
//!     │                                                       │
//!     └──────────── package removed: unload + delete ◄────────┘
//! ```
//!
//! One scan pass runs at a time. Within a pass, bundles are handled one
//! after another. A failure in one bundle is logged and the pass moves on;
//! a bundle that failed to load stays extracted and is retried next pass.
//! A bundle whose directory could not be deleted is held back: every pass
//! first retries the deletion, and the bundle is neither re-extracted nor
//! loaded until it succeeds.
//!
//! Passes run on the manager's blocking pool, driven by a task that wakes
//! on the scan interval, on file changes and on shutdown.
//!
//! The record table may be read from any thread while a pass runs.

pub mod archive;
pub mod context;
pub mod descriptor;
pub mod lua_component;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::component::{Component, ComponentKey};
use crate::constants::{DEFAULT_DELETE_RETRY_DELAY_MS, DEFAULT_DELETE_RETRY_LIMIT, DEFAULT_SCAN_INTERVAL_SECS};
use crate::error::{Error, Result};
use crate::file_watcher::PackageWatcher;
use crate::manager::ComponentManager;
use crate::util::{block_on, lock};

use self::archive::{extract, package_name};
use self::context::{CodeContext, ComponentRegistry};
use self::descriptor::BundleDescriptor;

/// Loader tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Time between scan passes.
    pub scan_interval: Duration,
    /// Attempts to delete a bundle directory within one pass.
    pub delete_retry_limit: u32,
    /// Pause between delete attempts.
    pub delete_retry_delay: Duration,
    /// Scan early when a package changes on disk.
    pub watch: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            delete_retry_limit: DEFAULT_DELETE_RETRY_LIMIT,
            delete_retry_delay: Duration::from_millis(DEFAULT_DELETE_RETRY_DELAY_MS),
            watch: true,
        }
    }
}

/// What the loader knows about one loaded bundle.
struct BundleRecord {
    component: Arc<dyn Component>,
    directory: PathBuf,
    context: CodeContext,
    descriptor: BundleDescriptor,
    /// A package existed when the bundle was loaded. Only such bundles are
    /// torn down when their package disappears.
    from_package: bool,
}

/// Scans a components directory and keeps the manager in sync with it.
pub struct ComponentLoader {
    root: PathBuf,
    manager: Arc<ComponentManager>,
    registry: ComponentRegistry,
    options: LoaderOptions,
    records: Mutex<HashMap<String, BundleRecord>>,
    /// Unloaded bundles whose directory is still on disk.
    pending_teardown: Mutex<BTreeMap<String, PathBuf>>,
    scan_lock: Mutex<()>,
    stopping: CancellationToken,
    wake: Mutex<Option<UnboundedSender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<PackageWatcher>>,
    first_scan: watch::Sender<bool>,
    remove_dir: fn(&Path) -> std::io::Result<()>,
}

impl std::fmt::Debug for ComponentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentLoader")
            .field("root", &self.root)
            .field("bundles", &self.bundles())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ComponentLoader {
    /// A loader for `root` that binds through `manager`.
    pub fn new(
        root: impl Into<PathBuf>,
        manager: Arc<ComponentManager>,
        registry: ComponentRegistry,
        options: LoaderOptions,
    ) -> Arc<Self> {
        Arc::new(Self::build(root.into(), manager, registry, options))
    }

    fn build(root: PathBuf, manager: Arc<ComponentManager>, registry: ComponentRegistry, options: LoaderOptions) -> Self {
        Self {
            root,
            manager,
            registry,
            options,
            records: Mutex::new(HashMap::new()),
            pending_teardown: Mutex::new(BTreeMap::new()),
            scan_lock: Mutex::new(()),
            stopping: CancellationToken::new(),
            wake: Mutex::new(None),
            worker: Mutex::new(None),
            watcher: Mutex::new(None),
            first_scan: watch::channel(false).0,
            remove_dir: |dir: &Path| fs::remove_dir_all(dir),
        }
    }

    /// Components directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start the scan task; the first pass runs immediately.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the components directory cannot be created.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        *lock(&self.wake) = Some(wake_tx.clone());

        let worker = self.manager.runtime().spawn(Arc::clone(self).run(wake_rx));
        *lock(&self.worker) = Some(worker);

        if self.options.watch {
            match PackageWatcher::new(&self.root, move || {
                let _ = wake_tx.send(());
            }) {
                Ok(watcher) => *lock(&self.watcher) = Some(watcher),
                Err(e) => log::warn!("[Loader] Not watching for changes: {e}"),
            }
        }

        log::info!(
            "[Loader] Scanning {} every {}s",
            self.root.display(),
            self.options.scan_interval.as_secs()
        );
        Ok(())
    }

    async fn run(self: Arc<Self>, mut wake: UnboundedReceiver<()>) {
        loop {
            let loader = Arc::clone(&self);
            if let Err(e) = tokio::task::spawn_blocking(move || loader.scan()).await {
                log::error!("[Loader] Scan pass failed: {e}");
            }
            self.mark_first_scan();

            tokio::select! {
                () = self.stopping.cancelled() => break,
                woken = wake.recv() => {
                    if woken.is_none() {
                        break;
                    }
                    // Collapse a burst of wake-ups into one pass.
                    while wake.try_recv().is_ok() {}
                }
                () = tokio::time::sleep(self.options.scan_interval) => {}
            }
        }
        log::debug!("[Loader] Scan task stopped");
    }

    /// Ask the scan task for an early pass.
    pub fn rescan(&self) {
        if let Some(tx) = lock(&self.wake).as_ref() {
            let _ = tx.send(());
        }
    }

    fn mark_first_scan(&self) {
        self.first_scan.send_replace(true);
    }

    /// Block until the first pass has finished or `timeout` elapses.
    ///
    /// Returns whether the first pass finished.
    pub fn wait_for_first_scan(&self, timeout: Duration) -> bool {
        let mut finished = self.first_scan.subscribe();
        block_on(self.manager.runtime(), async {
            matches!(
                tokio::time::timeout(timeout, finished.wait_for(|done| *done)).await,
                Ok(Ok(_))
            )
        })
    }

    /// Stop scanning and unload every bundle.
    ///
    /// Extracted directories are left in place for the next start.
    pub fn shutdown(&self) {
        self.stopping.cancel();
        lock(&self.watcher).take();
        lock(&self.wake).take();
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = block_on(self.manager.runtime(), worker) {
                log::warn!("[Loader] Scan task ended abnormally: {e}");
            }
        }

        let _pass = lock(&self.scan_lock);
        for bundle in self.bundles() {
            self.unload(&bundle);
        }
        self.mark_first_scan();
        log::info!("[Loader] Stopped");
    }

    // ------------------------------------------------------------------
    // Scan pass
    // ------------------------------------------------------------------

    /// Run one scan pass now, on the calling thread.
    ///
    /// Waits for a pass already in progress to finish first.
    pub fn scan(&self) {
        let _pass = lock(&self.scan_lock);
        if self.stopping.is_cancelled() {
            return;
        }
        if let Err(e) = fs::create_dir_all(&self.root) {
            log::error!("[Loader] Cannot create {}: {e}", self.root.display());
            return;
        }

        self.retry_teardowns();

        let packages = match self.list_packages() {
            Ok(packages) => packages,
            Err(e) => {
                log::error!("[Loader] Cannot list {}: {e}", self.root.display());
                return;
            }
        };

        for (bundle, package) in &packages {
            if self.stopping.is_cancelled() {
                return;
            }
            self.refresh_extraction(bundle, package);
        }

        match self.list_directories() {
            Ok(directories) => {
                for (bundle, dir) in directories {
                    if self.stopping.is_cancelled() {
                        return;
                    }
                    let known = lock(&self.records).contains_key(&bundle)
                        || lock(&self.pending_teardown).contains_key(&bundle);
                    if !known {
                        self.load(&bundle, &dir, packages.contains_key(&bundle));
                    }
                }
            }
            Err(e) => log::error!("[Loader] Cannot list {}: {e}", self.root.display()),
        }

        let removed: Vec<(String, PathBuf)> = lock(&self.records)
            .iter()
            .filter(|(bundle, record)| record.from_package && !packages.contains_key(*bundle))
            .map(|(bundle, record)| (bundle.clone(), record.directory.clone()))
            .collect();
        for (bundle, dir) in removed {
            if self.stopping.is_cancelled() {
                return;
            }
            log::info!("[Loader] Package for '{bundle}' was removed");
            self.unload(&bundle);
            self.tear_down(&bundle, &dir);
        }
    }

    /// Extract `package` if its directory is missing or older than it.
    fn refresh_extraction(&self, bundle: &str, package: &Path) {
        if lock(&self.pending_teardown).contains_key(bundle) {
            return;
        }
        let dir = self.root.join(bundle);
        if dir.exists() {
            if !is_newer(package, &dir) {
                return;
            }
            log::info!("[Loader] Package for '{bundle}' changed; reloading");
            self.unload(bundle);
            if !self.tear_down(bundle, &dir) {
                return;
            }
        }

        match extract(bundle, package, &dir) {
            Ok(true) => log::info!("[Loader] Extracted '{bundle}'"),
            Ok(false) => {}
            Err(e) => log::error!("[Loader] Failed to extract '{bundle}': {e}"),
        }
    }

    /// Packages by bundle name.
    ///
    /// When two files map to one bundle (`Echo.jar` and `echo.zip`), the
    /// first by file name wins and the other is ignored with a warning.
    fn list_packages(&self) -> std::io::Result<BTreeMap<String, PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let mut packages: BTreeMap<String, PathBuf> = BTreeMap::new();
        for path in files {
            let Some(bundle) = package_name(&path) else {
                continue;
            };
            if let Some(kept) = packages.get(&bundle) {
                log::warn!(
                    "[Loader] {} and {} both deploy bundle '{bundle}'; ignoring {}",
                    kept.display(),
                    path.display(),
                    path.display()
                );
                continue;
            }
            packages.insert(bundle, path);
        }
        Ok(packages)
    }

    fn list_directories(&self) -> std::io::Result<BTreeMap<String, PathBuf>> {
        let mut directories = BTreeMap::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                directories.insert(name.to_string(), path.clone());
            }
        }
        Ok(directories)
    }

    fn load(&self, bundle: &str, dir: &Path, from_package: bool) {
        match self.try_load(bundle, dir, from_package) {
            Ok(record) => {
                log::info!(
                    "[Loader] Loaded '{bundle}' ({} class '{}') on subdomain '{}'",
                    record.context.kind(),
                    record.descriptor.class,
                    record.descriptor.subdomain
                );
                lock(&self.records).insert(bundle.to_string(), record);
            }
            Err(e) => log::error!("[Loader] {e}"),
        }
    }

    fn try_load(&self, bundle: &str, dir: &Path, from_package: bool) -> Result<BundleRecord> {
        let descriptor = BundleDescriptor::read(bundle, dir)?;
        let (context, component) = CodeContext::open(bundle, dir, &descriptor.class, &self.registry)?;

        if let Err(e) = self
            .manager
            .add_component(&descriptor.subdomain, Arc::clone(&component))
        {
            context.destroy();
            return Err(Error::Load {
                bundle: bundle.to_string(),
                class: descriptor.class.clone(),
                reason: format!("binding '{}' failed: {e}", descriptor.subdomain),
            });
        }

        Ok(BundleRecord {
            component,
            directory: dir.to_path_buf(),
            context,
            descriptor,
            from_package,
        })
    }

    fn unload(&self, bundle: &str) -> bool {
        let Some(record) = lock(&self.records).remove(bundle) else {
            return false;
        };

        let subdomain = &record.descriptor.subdomain;
        let key = ComponentKey::of(record.component.as_ref());
        let ours = self
            .manager
            .component(subdomain)
            .is_some_and(|bound| ComponentKey::of(bound.as_ref()) == key);
        if ours {
            self.manager.remove_component(subdomain);
        }
        record.context.destroy();
        log::info!("[Loader] Unloaded '{bundle}'");
        true
    }

    /// Delete the directory of an unloaded bundle, or hold the bundle back
    /// until a later pass manages to.
    fn tear_down(&self, bundle: &str, dir: &Path) -> bool {
        let deleted = self.delete_directory(bundle, dir);
        if !deleted {
            lock(&self.pending_teardown).insert(bundle.to_string(), dir.to_path_buf());
        }
        deleted
    }

    fn retry_teardowns(&self) {
        let pending: Vec<(String, PathBuf)> = lock(&self.pending_teardown)
            .iter()
            .map(|(bundle, dir)| (bundle.clone(), dir.clone()))
            .collect();
        for (bundle, dir) in pending {
            if self.stopping.is_cancelled() {
                return;
            }
            log::info!("[Loader] Retrying deletion of '{bundle}' directory");
            if self.delete_directory(&bundle, &dir) {
                lock(&self.pending_teardown).remove(&bundle);
            }
        }
    }

    /// Delete `dir`, retrying with a pause between attempts.
    ///
    /// Returns `false` when the directory is still there.
    fn delete_directory(&self, bundle: &str, dir: &Path) -> bool {
        let limit = self.options.delete_retry_limit.max(1);
        for attempt in 1..=limit {
            match (self.remove_dir)(dir) {
                Ok(()) => return true,
                Err(e) if e.kind() == ErrorKind::NotFound => return true,
                Err(e) => {
                    log::warn!(
                        "[Loader] Cannot delete '{bundle}' directory (attempt {attempt}/{limit}): {e}"
                    );
                }
            }
            if attempt < limit && !self.pause(self.options.delete_retry_delay) {
                log::info!("[Loader] Shutting down; leaving '{bundle}' directory for later");
                return false;
            }
        }
        let error = Error::TeardownRetry {
            path: dir.display().to_string(),
            attempts: limit,
        };
        log::error!("[Loader] {error}; will retry next scan");
        false
    }

    /// Sleep for `delay`; returns `false` if the loader started stopping.
    fn pause(&self, delay: Duration) -> bool {
        block_on(self.manager.runtime(), async {
            tokio::select! {
                () = self.stopping.cancelled() => false,
                () = tokio::time::sleep(delay) => true,
            }
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Bundles held back until their directory can be deleted, sorted.
    pub fn pending_teardowns(&self) -> Vec<String> {
        lock(&self.pending_teardown).keys().cloned().collect()
    }

    /// Loaded bundle names, sorted.
    pub fn bundles(&self) -> Vec<String> {
        let mut bundles: Vec<_> = lock(&self.records).keys().cloned().collect();
        bundles.sort();
        bundles
    }

    /// Component instance of `bundle`.
    pub fn component(&self, bundle: &str) -> Option<Arc<dyn Component>> {
        lock(&self.records)
            .get(bundle)
            .map(|record| Arc::clone(&record.component))
    }

    /// Extracted directory of `bundle`.
    pub fn component_directory(&self, bundle: &str) -> Option<PathBuf> {
        lock(&self.records)
            .get(bundle)
            .map(|record| record.directory.clone())
    }

    /// Subdomain `bundle` is bound to.
    pub fn subdomain(&self, bundle: &str) -> Option<String> {
        self.with_descriptor(bundle, |d| Some(d.subdomain.clone()))
    }

    /// Display name of `bundle`, defaulting to its directory name.
    pub fn name(&self, bundle: &str) -> Option<String> {
        let records = lock(&self.records);
        let record = records.get(bundle)?;
        Some(record.descriptor.name.clone().unwrap_or_else(|| {
            record
                .directory
                .file_name()
                .map_or_else(|| bundle.to_string(), |n| n.to_string_lossy().into_owned())
        }))
    }

    /// Description of `bundle` from its descriptor.
    pub fn description(&self, bundle: &str) -> Option<String> {
        self.with_descriptor(bundle, |d| d.description.clone())
    }

    /// Author of `bundle` from its descriptor.
    pub fn author(&self, bundle: &str) -> Option<String> {
        self.with_descriptor(bundle, |d| d.author.clone())
    }

    /// Version of `bundle` from its descriptor.
    pub fn version(&self, bundle: &str) -> Option<String> {
        self.with_descriptor(bundle, |d| d.version.clone())
    }

    fn with_descriptor<T>(&self, bundle: &str, f: impl FnOnce(&BundleDescriptor) -> Option<T>) -> Option<T> {
        lock(&self.records)
            .get(bundle)
            .and_then(|record| f(&record.descriptor))
    }

    /// Unload `bundle` without touching its package or directory.
    ///
    /// The next pass loads it again, which makes this a restart.
    pub fn unload_component(&self, bundle: &str) -> bool {
        let _pass = lock(&self.scan_lock);
        self.unload(bundle)
    }
}

/// Whether `package` was modified after `dir`.
fn is_newer(package: &Path, dir: &Path) -> bool {
    let modified = |path: &Path| fs::metadata(path).and_then(|m| m.modified()).ok();
    match (modified(package), modified(dir)) {
        (Some(package), Some(dir)) => package > dir,
        (Some(_), None) => true,
        _ => false,
    }
}
