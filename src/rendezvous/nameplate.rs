//! Nameplate registry: short-id allocation, claim lifecycle, crowding, and
//! release.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::error::{ProtocolError, ProtocolResult};
use crate::store::Store;

/// One side's claim on a nameplate.
#[derive(Debug, Clone)]
pub struct NameplateSide {
    pub side: String,
    pub claimed: bool,
    pub added: f64,
}

/// A nameplate row plus its claimant sides.
#[derive(Debug, Clone)]
pub struct Nameplate {
    pub name: String,
    pub mailbox_id: String,
    pub sides: Vec<NameplateSide>,
}

impl Nameplate {
    fn active_side_count(&self) -> usize {
        self.sides.iter().filter(|s| s.claimed).count()
    }
}

/// In-memory nameplate table for one app, backed by a [`Store`] for durability.
#[derive(Default)]
pub struct NameplateRegistry {
    nameplates: HashMap<String, Nameplate>,
}

impl NameplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Nameplate> {
        self.nameplates.get(name)
    }

    pub fn get_nameplate_ids(&self) -> Vec<String> {
        self.nameplates.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nameplates.len()
    }

    /// Drop `name` from the live table without touching the store or
    /// checking claimant state, for callers (pruning) that already deleted
    /// the durable row themselves.
    pub fn remove(&mut self, name: &str) -> Option<Nameplate> {
        self.nameplates.remove(name)
    }

    /// Choose a fresh nameplate name by the progressive-widening policy,
    /// then claim it on `side`'s behalf.
    pub async fn allocate(
        &mut self,
        app_id: &str,
        side: &str,
        now: f64,
        store: &Arc<dyn Store>,
        new_mailbox_id: impl FnOnce() -> String,
    ) -> ProtocolResult<String> {
        let upper_bound: u64 = if self.nameplates.len() < 9 {
            10
        } else if self.nameplates.len() < 99 {
            100
        } else if self.nameplates.len() < 999 {
            1_000
        } else {
            1_000_000
        };

        let name = loop {
            let candidate = rand::thread_rng().gen_range(1..upper_bound).to_string();
            if !self.nameplates.contains_key(&candidate) {
                break candidate;
            }
        };

        self.claim(app_id, &name, side, now, store, new_mailbox_id)
            .await?;
        Ok(name)
    }

    /// Claim `name` on behalf of `side`, creating the nameplate (and its
    /// mailbox) if it doesn't exist yet. A third distinct claimant still gets
    /// a recorded side row, but the call fails with [`ProtocolError::Crowded`].
    pub async fn claim(
        &mut self,
        app_id: &str,
        name: &str,
        side: &str,
        now: f64,
        store: &Arc<dyn Store>,
        new_mailbox_id: impl FnOnce() -> String,
    ) -> ProtocolResult<String> {
        if let Some(nameplate) = self.nameplates.get_mut(name) {
            if nameplate.sides.iter().any(|s| s.side == side) {
                // The side already has a row (claimed or not): return the
                // existing mailbox id and leave `added` untouched.
                return Ok(nameplate.mailbox_id.clone());
            }

            let crowded = nameplate.active_side_count() >= 2;
            nameplate.sides.push(NameplateSide {
                side: side.to_owned(),
                claimed: true,
                added: now,
            });
            store
                .upsert_nameplate_side(app_id, name, side, true, now)
                .await
                .ok();

            if crowded {
                Err(ProtocolError::Crowded)
            } else {
                Ok(nameplate.mailbox_id.clone())
            }
        } else {
            let mailbox_id = new_mailbox_id();
            let nameplate = Nameplate {
                name: name.to_owned(),
                mailbox_id: mailbox_id.clone(),
                sides: vec![NameplateSide {
                    side: side.to_owned(),
                    claimed: true,
                    added: now,
                }],
            };
            self.nameplates.insert(name.to_owned(), nameplate);
            store.upsert_nameplate(app_id, name, &mailbox_id, now).await.ok();
            store
                .upsert_nameplate_side(app_id, name, side, true, now)
                .await
                .ok();
            Ok(mailbox_id)
        }
    }

    /// Release `side`'s claim on `name`. Unknown nameplate or side: silent
    /// no-op. When the last claimed side releases, the nameplate is deleted
    /// and its teardown usage rows are the caller's responsibility to emit
    /// (see [`crate::rendezvous::app::AppNamespace::release_nameplate`]).
    pub async fn release(
        &mut self,
        app_id: &str,
        name: &str,
        side: &str,
        store: &Arc<dyn Store>,
    ) -> Option<Nameplate> {
        let Some(nameplate) = self.nameplates.get_mut(name) else {
            return None;
        };
        if let Some(s) = nameplate.sides.iter_mut().find(|s| s.side == side) {
            s.claimed = false;
            store
                .upsert_nameplate_side(app_id, name, side, false, s.added)
                .await
                .ok();
        } else {
            return None;
        }

        if nameplate.active_side_count() == 0 {
            let removed = self.nameplates.remove(name);
            store.delete_nameplate(app_id, name).await.ok();
            removed
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    async fn registry_with_store() -> (NameplateRegistry, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        (NameplateRegistry::new(), store)
    }

    #[tokio::test]
    async fn allocate_is_decimal_and_widens() {
        let (mut reg, store) = registry_with_store().await;
        let mut seen = std::collections::HashSet::new();
        for i in 0..9 {
            let name = reg
                .allocate("app", &format!("side{i}"), 0.0, &store, || format!("mbox{i}"))
                .await
                .unwrap();
            let n: u64 = name.parse().unwrap();
            assert!((1..10).contains(&n));
            seen.insert(n);
        }
        assert_eq!(seen.len(), 9);
    }

    #[tokio::test]
    async fn claim_is_idempotent_for_same_side() {
        let (mut reg, store) = registry_with_store().await;
        let name = reg
            .allocate("app", "side1", 0.0, &store, || "mboxA".into())
            .await
            .unwrap();
        let mb1 = reg
            .claim("app", &name, "side1", 5.0, &store, || unreachable!())
            .await
            .unwrap();
        assert_eq!(mb1, "mboxA");
        let added = reg.get(&name).unwrap().sides[0].added;
        assert_eq!(added, 0.0);
    }

    #[tokio::test]
    async fn third_claim_is_crowded_but_recorded() {
        let (mut reg, store) = registry_with_store().await;
        reg.claim("app", "n", "side1", 0.0, &store, || "mboxA".into())
            .await
            .unwrap();
        reg.claim("app", "n", "side2", 1.0, &store, || unreachable!())
            .await
            .unwrap();
        let err = reg
            .claim("app", "n", "side3", 2.0, &store, || unreachable!())
            .await
            .unwrap_err();
        assert_eq!(err, ProtocolError::Crowded);
        assert_eq!(reg.get("n").unwrap().sides.len(), 3);
    }

    #[tokio::test]
    async fn release_deletes_when_empty() {
        let (mut reg, store) = registry_with_store().await;
        reg.claim("app", "n", "side1", 0.0, &store, || "mboxA".into())
            .await
            .unwrap();
        assert!(reg.release("app", "n", "side1", &store).await.is_some());
        assert!(reg.get("n").is_none());
    }

    #[tokio::test]
    async fn release_unknown_is_silent() {
        let (mut reg, store) = registry_with_store().await;
        assert!(reg.release("app", "missing", "side1", &store).await.is_none());
    }
}
