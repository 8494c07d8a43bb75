//! Per-`app_id` namespace: owns the nameplate registry and the live mailbox
//! map, and turns nameplate/mailbox teardown into usage records.

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;

use crate::error::ProtocolResult;
use crate::message::Mood;
use crate::rendezvous::mailbox::{Mailbox, SidedMessage};
use crate::rendezvous::nameplate::NameplateRegistry;
use crate::rendezvous::usage::{self, SideSummary};
use crate::store::Store;

fn random_mailbox_id() -> String {
    let mut buf = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// One application's nameplates and mailboxes. Apps never talk to each
/// other's namespaces; a nameplate or mailbox id is only unique within one.
pub struct AppNamespace {
    app_id: String,
    blur_usage: Option<f64>,
    nameplates: NameplateRegistry,
    mailboxes: HashMap<String, Mailbox>,
}

impl AppNamespace {
    pub fn new(app_id: String, blur_usage: Option<f64>) -> Self {
        AppNamespace {
            app_id,
            blur_usage,
            nameplates: NameplateRegistry::new(),
            mailboxes: HashMap::new(),
        }
    }

    pub fn list_nameplate_ids(&self) -> Vec<String> {
        self.nameplates.get_nameplate_ids()
    }

    pub async fn allocate_nameplate(
        &mut self,
        side: &str,
        now: f64,
        store: &Arc<dyn Store>,
    ) -> ProtocolResult<String> {
        let result = self
            .nameplates
            .allocate(&self.app_id, side, now, store, random_mailbox_id)
            .await;
        if let Ok(nameplate) = &result {
            let mailbox_id = self.nameplates.get(nameplate).map(|n| n.mailbox_id.clone());
            if let Some(mailbox_id) = mailbox_id {
                self.mailbox_mut(&mailbox_id, true, now);
            }
        }
        result
    }

    /// Claim `name`, returning the mailbox id bound to it (whether or not
    /// that mailbox has been opened yet). A nameplate's mailbox entry always
    /// exists from first claim, even unopened, so pruning can track it by the
    /// same 1:1 relationship the data model requires.
    pub async fn claim_nameplate(
        &mut self,
        name: &str,
        side: &str,
        now: f64,
        store: &Arc<dyn Store>,
    ) -> ProtocolResult<String> {
        let result = self
            .nameplates
            .claim(&self.app_id, name, side, now, store, random_mailbox_id)
            .await;
        if let Ok(mailbox_id) = &result {
            self.mailbox_mut(mailbox_id, true, now);
        }
        result
    }

    /// Release `side`'s claim on `name`. If this empties the nameplate, its
    /// usage record is summarized and persisted here.
    pub async fn release_nameplate(
        &mut self,
        name: &str,
        side: &str,
        now: f64,
        store: &Arc<dyn Store>,
    ) {
        if let Some(removed) = self.nameplates.release(&self.app_id, name, side, store).await {
            let rows: Vec<SideSummary> = removed
                .sides
                .iter()
                .map(|s| SideSummary {
                    added: s.added,
                    mood: None,
                })
                .collect();
            let mut usage = usage::summarize_nameplate(&rows, now, false);
            usage.started = usage::blur_started(usage.started, self.blur_usage);
            store.insert_nameplate_usage(&self.app_id, &usage).await.ok();
        }
    }

    fn mailbox_mut(&mut self, mailbox_id: &str, for_nameplate: bool, now: f64) -> &mut Mailbox {
        self.mailboxes
            .entry(mailbox_id.to_owned())
            .or_insert_with(|| Mailbox::new(mailbox_id.to_owned(), for_nameplate, now))
    }

    pub async fn open_mailbox(
        &mut self,
        mailbox_id: &str,
        side: &str,
        now: f64,
        store: &Arc<dyn Store>,
    ) -> ProtocolResult<()> {
        store.upsert_mailbox(&self.app_id, mailbox_id, now, false).await.ok();
        let app_id = self.app_id.clone();
        let mailbox = self.mailbox_mut(mailbox_id, false, now);
        mailbox.open(&app_id, side, now, store).await
    }

    pub fn get_mailbox(&mut self, mailbox_id: &str) -> Option<&mut Mailbox> {
        self.mailboxes.get_mut(mailbox_id)
    }

    pub async fn add_message(
        &mut self,
        mailbox_id: &str,
        msg: SidedMessage,
        store: &Arc<dyn Store>,
    ) {
        let app_id = self.app_id.clone();
        if let Some(mailbox) = self.mailboxes.get_mut(mailbox_id) {
            mailbox.add_message(&app_id, msg, store).await;
        }
    }

    /// Close `side` on `mailbox_id`. If this empties the mailbox, summarize
    /// and persist its usage record, then drop it from the live map.
    pub async fn close_mailbox(
        &mut self,
        mailbox_id: &str,
        side: &str,
        mood: Option<Mood>,
        now: f64,
        store: &Arc<dyn Store>,
    ) {
        let app_id = self.app_id.clone();
        let Some(mailbox) = self.mailboxes.get_mut(mailbox_id) else {
            return;
        };
        let emptied = mailbox.close(&app_id, side, mood, now, store).await;
        if emptied && !mailbox.has_listeners() {
            let rows: Vec<SideSummary> = mailbox
                .sides
                .iter()
                .map(|s| SideSummary {
                    added: s.added,
                    mood: s.mood.as_deref(),
                })
                .collect();
            let mut usage = usage::summarize_mailbox(&rows, now, false);
            usage.started = usage::blur_started(usage.started, self.blur_usage);
            store.insert_mailbox_usage(&app_id, &usage).await.ok();
            store.delete_mailbox(&app_id, mailbox_id).await.ok();
            self.mailboxes.remove(mailbox_id);
        }
    }

    /// Drop every nameplate/mailbox whose last activity predates
    /// `old_threshold`, recording a `"pruney"` usage record for each. Called
    /// periodically by the rendezvous server.
    ///
    /// A mailbox is live (not pruned) if it has listeners, its `updated` is
    /// recent, or any of its sides opened recently. A nameplate is pruned
    /// exactly when its mailbox is pruned, not by its own side ages.
    pub async fn prune(&mut self, now: f64, old_threshold: f64, store: &Arc<dyn Store>) {
        let stale_mailboxes: Vec<String> = self
            .mailboxes
            .iter()
            .filter(|(_, mb)| {
                !mb.has_listeners()
                    && mb.updated < old_threshold
                    && mb.sides.iter().all(|s| s.added < old_threshold)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let stale_nameplates: Vec<String> = self
            .nameplates
            .get_nameplate_ids()
            .into_iter()
            .filter(|name| {
                self.nameplates
                    .get(name)
                    .map(|n| stale_mailboxes.contains(&n.mailbox_id))
                    .unwrap_or(false)
            })
            .collect();

        for name in stale_nameplates {
            if let Some(nameplate) = self.nameplates.get(&name) {
                let rows: Vec<SideSummary> = nameplate
                    .sides
                    .iter()
                    .map(|s| SideSummary {
                        added: s.added,
                        mood: None,
                    })
                    .collect();
                let mut usage = usage::summarize_nameplate(&rows, now, true);
                usage.started = usage::blur_started(usage.started, self.blur_usage);
                store.insert_nameplate_usage(&self.app_id, &usage).await.ok();
            }
            store.delete_nameplate(&self.app_id, &name).await.ok();
            self.nameplates_remove(&name);
        }

        for mailbox_id in stale_mailboxes {
            if let Some(mailbox) = self.mailboxes.get(&mailbox_id) {
                let rows: Vec<SideSummary> = mailbox
                    .sides
                    .iter()
                    .map(|s| SideSummary {
                        added: s.added,
                        mood: s.mood.as_deref(),
                    })
                    .collect();
                let rows = if rows.is_empty() {
                    vec![SideSummary {
                        added: mailbox.updated,
                        mood: None,
                    }]
                } else {
                    rows
                };
                let mut usage = usage::summarize_mailbox(&rows, now, true);
                usage.started = usage::blur_started(usage.started, self.blur_usage);
                store.insert_mailbox_usage(&self.app_id, &usage).await.ok();
            }
            store.delete_mailbox(&self.app_id, &mailbox_id).await.ok();
            self.mailboxes.remove(&mailbox_id);
        }
    }

    /// Helper since [`NameplateRegistry`] only exposes `release`, which
    /// requires knowing a claimant side; pruning removes by name directly.
    fn nameplates_remove(&mut self, name: &str) {
        self.nameplates.remove(name);
    }

    /// Drop every listener on every live mailbox, signaling connected
    /// clients to stop, without deleting any durable state.
    pub fn shutdown(&mut self) {
        for mailbox in self.mailboxes.values_mut() {
            mailbox.shutdown();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nameplates.len() == 0 && self.mailboxes.is_empty()
    }
}
