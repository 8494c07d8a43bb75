//! Transactional persistence for the rendezvous entity model.
//!
//! The [`Store`] trait is the typed wrapper over SQL the core rendezvous
//! logic depends on; it carries no business rules of its own (crowding,
//! allocation policy, summarization all live in [`crate::rendezvous`]).
//! [`SqliteStore`] is the only implementation, backed by `sqlx`'s SQLite
//! driver, grounded on the database stack already present in the pack
//! (`examples/revskill10-ream/Cargo.toml`).

pub mod models;

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

pub use models::{StoredMessage, TransitUsage, Usage};

use crate::error::StoreResult;

/// Typed wrapper over the relational schema backing apps, nameplates,
/// mailboxes, messages and usage records.
///
/// Every mutating method commits its own transaction before returning.
/// Callers (the in-memory [`crate::rendezvous`] model) treat
/// this purely as a durability and usage-accounting sink: the in-memory maps
/// remain the source of truth for what's live in this process.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_nameplate(
        &self,
        app_id: &str,
        name: &str,
        mailbox_id: &str,
        updated: f64,
    ) -> StoreResult<()>;

    async fn upsert_nameplate_side(
        &self,
        app_id: &str,
        name: &str,
        side: &str,
        claimed: bool,
        added: f64,
    ) -> StoreResult<()>;

    async fn delete_nameplate(&self, app_id: &str, name: &str) -> StoreResult<()>;

    async fn upsert_mailbox(
        &self,
        app_id: &str,
        mailbox_id: &str,
        updated: f64,
        for_nameplate: bool,
    ) -> StoreResult<()>;

    async fn upsert_mailbox_side(
        &self,
        app_id: &str,
        mailbox_id: &str,
        side: &str,
        opened: bool,
        added: f64,
        mood: Option<&str>,
    ) -> StoreResult<()>;

    async fn delete_mailbox(&self, app_id: &str, mailbox_id: &str) -> StoreResult<()>;

    async fn add_message(&self, msg: &StoredMessage) -> StoreResult<()>;

    async fn list_messages(&self, app_id: &str, mailbox_id: &str) -> StoreResult<Vec<StoredMessage>>;

    async fn insert_nameplate_usage(&self, app_id: &str, usage: &Usage) -> StoreResult<()>;

    async fn insert_mailbox_usage(&self, app_id: &str, usage: &Usage) -> StoreResult<()>;

    async fn insert_transit_usage(&self, usage: &TransitUsage) -> StoreResult<()>;
}

/// `sqlx`-backed [`Store`] implementation. `db_url` follows `sqlx`'s SQLite
/// connection string conventions, e.g. `sqlite::memory:` or
/// `sqlite:///var/lib/wormhole/relay.db`.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(db_url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;
        let store = SqliteStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS apps (
    app_id TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS nameplates (
    app_id TEXT NOT NULL,
    name TEXT NOT NULL,
    mailbox_id TEXT NOT NULL,
    updated REAL NOT NULL,
    PRIMARY KEY (app_id, name)
);

CREATE TABLE IF NOT EXISTS nameplate_sides (
    app_id TEXT NOT NULL,
    name TEXT NOT NULL,
    side TEXT NOT NULL,
    claimed INTEGER NOT NULL,
    added REAL NOT NULL,
    PRIMARY KEY (app_id, name, side)
);

CREATE TABLE IF NOT EXISTS mailboxes (
    app_id TEXT NOT NULL,
    id TEXT NOT NULL,
    updated REAL NOT NULL,
    for_nameplate INTEGER NOT NULL,
    PRIMARY KEY (app_id, id)
);

CREATE TABLE IF NOT EXISTS mailbox_sides (
    app_id TEXT NOT NULL,
    mailbox_id TEXT NOT NULL,
    side TEXT NOT NULL,
    opened INTEGER NOT NULL,
    added REAL NOT NULL,
    mood TEXT,
    PRIMARY KEY (app_id, mailbox_id, side)
);

CREATE TABLE IF NOT EXISTS messages (
    app_id TEXT NOT NULL,
    mailbox_id TEXT NOT NULL,
    side TEXT NOT NULL,
    phase TEXT NOT NULL,
    body BLOB NOT NULL,
    server_rx REAL NOT NULL,
    msg_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nameplate_usage (
    app_id TEXT NOT NULL,
    started REAL NOT NULL,
    waiting_time REAL,
    total_time REAL NOT NULL,
    result TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mailbox_usage (
    app_id TEXT NOT NULL,
    started REAL NOT NULL,
    waiting_time REAL,
    total_time REAL NOT NULL,
    result TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transit_usage (
    started REAL NOT NULL,
    total_time REAL NOT NULL,
    total_bytes INTEGER NOT NULL,
    result TEXT NOT NULL
);
"#;

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_nameplate(
        &self,
        app_id: &str,
        name: &str,
        mailbox_id: &str,
        updated: f64,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO apps (app_id) VALUES (?) ON CONFLICT(app_id) DO NOTHING")
            .bind(app_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO nameplates (app_id, name, mailbox_id, updated) VALUES (?, ?, ?, ?)
             ON CONFLICT(app_id, name) DO UPDATE SET mailbox_id = excluded.mailbox_id, updated = excluded.updated",
        )
        .bind(app_id)
        .bind(name)
        .bind(mailbox_id)
        .bind(updated)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_nameplate_side(
        &self,
        app_id: &str,
        name: &str,
        side: &str,
        claimed: bool,
        added: f64,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO nameplate_sides (app_id, name, side, claimed, added) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(app_id, name, side) DO UPDATE SET claimed = excluded.claimed",
        )
        .bind(app_id)
        .bind(name)
        .bind(side)
        .bind(claimed)
        .bind(added)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_nameplate(&self, app_id: &str, name: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM nameplate_sides WHERE app_id = ? AND name = ?")
            .bind(app_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM nameplates WHERE app_id = ? AND name = ?")
            .bind(app_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_mailbox(
        &self,
        app_id: &str,
        mailbox_id: &str,
        updated: f64,
        for_nameplate: bool,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO apps (app_id) VALUES (?) ON CONFLICT(app_id) DO NOTHING")
            .bind(app_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO mailboxes (app_id, id, updated, for_nameplate) VALUES (?, ?, ?, ?)
             ON CONFLICT(app_id, id) DO UPDATE SET updated = excluded.updated",
        )
        .bind(app_id)
        .bind(mailbox_id)
        .bind(updated)
        .bind(for_nameplate)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_mailbox_side(
        &self,
        app_id: &str,
        mailbox_id: &str,
        side: &str,
        opened: bool,
        added: f64,
        mood: Option<&str>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO mailbox_sides (app_id, mailbox_id, side, opened, added, mood)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(app_id, mailbox_id, side)
             DO UPDATE SET opened = excluded.opened, mood = excluded.mood",
        )
        .bind(app_id)
        .bind(mailbox_id)
        .bind(side)
        .bind(opened)
        .bind(added)
        .bind(mood)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_mailbox(&self, app_id: &str, mailbox_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE app_id = ? AND mailbox_id = ?")
            .bind(app_id)
            .bind(mailbox_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mailbox_sides WHERE app_id = ? AND mailbox_id = ?")
            .bind(app_id)
            .bind(mailbox_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mailboxes WHERE app_id = ? AND id = ?")
            .bind(app_id)
            .bind(mailbox_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_message(&self, msg: &StoredMessage) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages (app_id, mailbox_id, side, phase, body, server_rx, msg_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.app_id)
        .bind(&msg.mailbox_id)
        .bind(&msg.side)
        .bind(&msg.phase)
        .bind(&msg.body)
        .bind(msg.server_rx)
        .bind(&msg.msg_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE mailboxes SET updated = ? WHERE app_id = ? AND id = ?")
            .bind(msg.server_rx)
            .bind(&msg.app_id)
            .bind(&msg.mailbox_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_messages(&self, app_id: &str, mailbox_id: &str) -> StoreResult<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT side, phase, body, server_rx, msg_id FROM messages
             WHERE app_id = ? AND mailbox_id = ? ORDER BY rowid ASC",
        )
        .bind(app_id)
        .bind(mailbox_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| StoredMessage {
                app_id: app_id.to_owned(),
                mailbox_id: mailbox_id.to_owned(),
                side: row.get("side"),
                phase: row.get("phase"),
                body: row.get("body"),
                server_rx: row.get("server_rx"),
                msg_id: row.get("msg_id"),
            })
            .collect())
    }

    async fn insert_nameplate_usage(&self, app_id: &str, usage: &Usage) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO nameplate_usage (app_id, started, waiting_time, total_time, result)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(app_id)
        .bind(usage.started)
        .bind(usage.waiting_time)
        .bind(usage.total_time)
        .bind(usage.result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_mailbox_usage(&self, app_id: &str, usage: &Usage) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO mailbox_usage (app_id, started, waiting_time, total_time, result)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(app_id)
        .bind(usage.started)
        .bind(usage.waiting_time)
        .bind(usage.total_time)
        .bind(usage.result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_transit_usage(&self, usage: &TransitUsage) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO transit_usage (started, total_time, total_bytes, result) VALUES (?, ?, ?, ?)",
        )
        .bind(usage.started)
        .bind(usage.total_time)
        .bind(usage.total_bytes as i64)
        .bind(usage.result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn nameplate_roundtrip() {
        let store = memory_store().await;
        store
            .upsert_nameplate("app1", "5", "mbox1", 10.0)
            .await
            .unwrap();
        store
            .upsert_nameplate_side("app1", "5", "sideA", true, 10.0)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nameplate_sides WHERE app_id = ? AND name = ?",
        )
        .bind("app1")
        .bind("5")
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(count, 1);

        store.delete_nameplate("app1", "5").await.unwrap();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nameplate_sides WHERE app_id = ? AND name = ?",
        )
        .bind("app1")
        .bind("5")
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn message_append_and_list() {
        let store = memory_store().await;
        store
            .upsert_mailbox("app1", "mbox1", 1.0, true)
            .await
            .unwrap();
        store
            .add_message(&StoredMessage {
                app_id: "app1".into(),
                mailbox_id: "mbox1".into(),
                side: "sideA".into(),
                phase: "0".into(),
                body: vec![1, 2, 3],
                server_rx: 1.0,
                msg_id: "m1".into(),
            })
            .await
            .unwrap();
        store
            .add_message(&StoredMessage {
                app_id: "app1".into(),
                mailbox_id: "mbox1".into(),
                side: "sideA".into(),
                phase: "1".into(),
                body: vec![4, 5],
                server_rx: 2.0,
                msg_id: "m2".into(),
            })
            .await
            .unwrap();
        let msgs = store.list_messages("app1", "mbox1").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].msg_id, "m1");
        assert_eq!(msgs[1].msg_id, "m2");
    }

    #[tokio::test]
    async fn usage_rows_persist() {
        let store = memory_store().await;
        store
            .insert_nameplate_usage("app1", &Usage::new(0.0, Some(3.0), 7.0, "crowded"))
            .await
            .unwrap();
        store
            .insert_mailbox_usage("app1", &Usage::new(1.0, None, 4.0, "lonely"))
            .await
            .unwrap();
        store
            .insert_transit_usage(&TransitUsage {
                started: 0.0,
                total_time: 1.0,
                total_bytes: 10_000,
                result: "happy",
            })
            .await
            .unwrap();
    }
}
