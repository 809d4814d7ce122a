//! Best-effort save notifications.
//!
//! After a durable write the pipeline publishes a `SaveConfirmation` on the
//! document's channel. This is the signal that flips a client's status from
//! "synced" (visible to peers in memory) to "saved" (durable). Delivery is
//! best-effort: the authoritative state is always re-derivable from the
//! document store, so a missed message never means a failed save.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;

use crate::models::SaveConfirmation;
use crate::types::AppResult;

/// Channel name for a document's save confirmations.
pub fn saved_channel(document_name: &str) -> String {
    format!("doc:{document_name}:saved")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, document_name: &str, confirmation: &SaveConfirmation)
        -> AppResult<()>;
}

/// Redis pub/sub publisher used in production: collaboration servers
/// subscribe to `doc:{name}:saved` and fan the confirmation out to clients.
pub struct RedisNotifier {
    con: ConnectionManager,
}

impl RedisNotifier {
    pub fn new(con: ConnectionManager) -> Self {
        Self { con }
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn publish(
        &self,
        document_name: &str,
        confirmation: &SaveConfirmation,
    ) -> AppResult<()> {
        let mut con = self.con.clone();
        let payload = serde_json::to_string(confirmation)?;
        let _: () = con.publish(saved_channel(document_name), payload).await?;
        Ok(())
    }
}

/// In-process publisher over a tokio broadcast channel, for tests and
/// embedded deployments. Having no subscribers is not an error.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<(String, SaveConfirmation)>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, SaveConfirmation)> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn publish(
        &self,
        document_name: &str,
        confirmation: &SaveConfirmation,
    ) -> AppResult<()> {
        let _ = self
            .sender
            .send((saved_channel(document_name), confirmation.clone()));
        Ok(())
    }
}
