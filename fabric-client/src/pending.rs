//! Pending-request correlation table: id -> the continuation waiting on its response.
//! Owned exclusively by the session loop task (see `adapter::run_connected`), so no
//! locking is needed -- the same single-task-per-connection discipline the fabric
//! uses server-side.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

/// `Ok` carries the response's `result`; `Err` carries its `error` message.
pub type PendingOutcome = Result<Value, String>;

#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<String, oneshot::Sender<PendingOutcome>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: String, respond_to: oneshot::Sender<PendingOutcome>) {
        self.entries.insert(id, respond_to);
    }

    /// Resolves and removes the entry for `id`, if one is still registered (it may
    /// already have timed out and been dropped by the caller).
    pub fn resolve(&mut self, id: &str, outcome: PendingOutcome) {
        if let Some(respond_to) = self.entries.remove(id) {
            let _ = respond_to.send(outcome);
        }
    }

    /// Drops every pending continuation without resolving it. Their receivers will
    /// see a closed channel and the caller's own 5 s timeout (or this) is what
    /// actually surfaces the rejection -- reconnecting never replays them.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolving_an_unknown_id_is_a_no_op() {
        let mut table = PendingTable::new();
        table.resolve("missing", Ok(json!(1)));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn resolve_delivers_the_outcome_to_the_registered_receiver() {
        let mut table = PendingTable::new();
        let (tx, rx) = oneshot::channel();
        table.register("1".to_string(), tx);
        table.resolve("1", Ok(json!({"ok": true})));
        assert_eq!(rx.await.unwrap(), Ok(json!({"ok": true})));
    }

    #[test]
    fn clear_drops_every_entry() {
        let mut table = PendingTable::new();
        let (tx, _rx) = oneshot::channel();
        table.register("1".to_string(), tx);
        table.clear();
        assert_eq!(table.len(), 0);
    }
}
