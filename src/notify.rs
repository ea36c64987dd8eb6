use crate::db;
use rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Role(String),
    User(String),
}

impl Audience {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Role(_) => "role",
            Self::User(_) => "user",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Role(s) | Self::User(s) => s,
        }
    }
}

pub const EVENT_UPLOADED: &str = "attendance:uploaded";
pub const EVENT_DEFAULTERS: &str = "defaulters:alert";
pub const EVENT_SYNCED: &str = "allocations:synced";
pub const EVENT_BULK_MARKED: &str = "attendance:bulkMarked";

/// Publish-only capability; the engine never cares how events travel.
pub trait Notifier {
    fn publish(
        &self,
        audience: &Audience,
        event: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()>;
}

pub struct OutboxNotifier<'a> {
    conn: &'a Connection,
}

impl<'a> OutboxNotifier<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl Notifier for OutboxNotifier<'_> {
    fn publish(
        &self,
        audience: &Audience,
        event: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO notifications(id, audience_kind, audience, event, payload_json, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                audience.kind(),
                audience.id(),
                event,
                serde_json::to_string(payload)?,
                db::now_rfc3339(),
            ),
        )?;
        log::debug!("published {} to {}:{}", event, audience.kind(), audience.id());
        Ok(())
    }
}

pub fn publish_all(
    notifier: &dyn Notifier,
    audiences: &[Audience],
    event: &str,
    payload: &serde_json::Value,
) {
    for a in audiences {
        if let Err(e) = notifier.publish(a, event, payload) {
            log::warn!("failed to publish {} to {}:{}: {:#}", event, a.kind(), a.id(), e);
        }
    }
}
