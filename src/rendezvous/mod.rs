//! Rendezvous server: nameplates, mailboxes, and the WebSocket protocol that
//! binds them together.

pub mod app;
pub mod connection;
pub mod mailbox;
pub mod nameplate;
pub mod usage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::message::now;
use crate::store::Store;

pub use app::AppNamespace;

/// Top-level rendezvous state: one [`AppNamespace`] per distinct `app_id`,
/// created lazily on first bind.
pub struct RendezvousServer {
    store: Arc<dyn Store>,
    blur_usage: Option<f64>,
    advertise_version: String,
    apps: Mutex<HashMap<String, AppNamespace>>,
}

impl RendezvousServer {
    pub fn new(store: Arc<dyn Store>, blur_usage: Option<f64>, advertise_version: String) -> Self {
        RendezvousServer {
            store,
            blur_usage,
            advertise_version,
            apps: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn advertise_version(&self) -> &str {
        &self.advertise_version
    }

    /// Run `f` against the namespace for `app_id`, creating it if this is
    /// the first connection ever to bind to it.
    pub async fn with_app<R>(&self, app_id: &str, f: impl FnOnce(&mut AppNamespace) -> R) -> R {
        let mut apps = self.apps.lock().await;
        let app = apps
            .entry(app_id.to_owned())
            .or_insert_with(|| AppNamespace::new(app_id.to_owned(), self.blur_usage));
        f(app)
    }

    /// Lock the full app table for multi-step async operations (bind, claim,
    /// open, add, close) that need to hold the namespace across `.await`
    /// points inside [`AppNamespace`]'s own `Store`-backed methods.
    pub async fn lock_apps(&self) -> tokio::sync::MutexGuard<'_, HashMap<String, AppNamespace>> {
        self.apps.lock().await
    }

    /// Borrow (creating if absent) the namespace for `app_id` from an
    /// already-locked app table.
    pub fn get_or_create_app<'a>(
        &self,
        apps: &'a mut HashMap<String, AppNamespace>,
        app_id: &str,
    ) -> &'a mut AppNamespace {
        apps.entry(app_id.to_owned())
            .or_insert_with(|| AppNamespace::new(app_id.to_owned(), self.blur_usage))
    }

    /// Prune every app namespace of nameplates/mailboxes idle since before
    /// `old_threshold`. The namespace itself is never destroyed, even once
    /// emptied, for as long as the process runs.
    pub async fn prune_all(&self, old_threshold: f64) {
        let now = now();
        let mut apps = self.apps.lock().await;
        for app in apps.values_mut() {
            app.prune(now, old_threshold, &self.store).await;
        }
    }

    /// Spawn the periodic pruning task. Runs until the process exits;
    /// intended to be spawned once from `main`.
    pub async fn run_pruning_loop(self: Arc<Self>, prune_interval: Duration, channel_expiration: f64) {
        let mut ticker = tokio::time::interval(prune_interval);
        loop {
            ticker.tick().await;
            let old_threshold = now() - channel_expiration;
            self.prune_all(old_threshold).await;
        }
    }

    /// Drop every listener on every mailbox in every app, without deleting
    /// any durable state, ahead of a graceful shutdown.
    pub async fn shutdown(&self) {
        let mut apps = self.apps.lock().await;
        for app in apps.values_mut() {
            app.shutdown();
        }
    }
}
