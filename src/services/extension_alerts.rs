//! Tracks open lease-extension requests per owner and notifies watchers when
//! the counts change.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use super::realtime::{ChangeFeed, ChangeKind, RowChange, Subscription};
use crate::{repository::table_service::list_all_rows, state::AppState};

pub const EXTENSION_REQUESTS_TABLE: &str = "extension_requests";
pub const OPEN_STATUS: &str = "pending";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtensionSnapshot {
    pub open_by_owner: BTreeMap<String, usize>,
}

impl ExtensionSnapshot {
    pub fn open_count(&self, owner_id: &str) -> usize {
        self.open_by_owner.get(owner_id).copied().unwrap_or(0)
    }
}

pub struct ExtensionAlertStore {
    /// request id -> owner id, for requests that are currently open
    open: Mutex<HashMap<String, String>>,
    sender: watch::Sender<ExtensionSnapshot>,
}

impl Default for ExtensionAlertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionAlertStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ExtensionSnapshot::default());
        Self {
            open: Mutex::new(HashMap::new()),
            sender,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ExtensionSnapshot> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> ExtensionSnapshot {
        self.sender.borrow().clone()
    }

    /// Replaces the tracked set with the open requests among `rows`.
    pub fn seed(&self, rows: &[Value]) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.clear();
        for row in rows {
            if let Some((request_id, owner_id)) = open_entry(row) {
                open.insert(request_id, owner_id);
            }
        }
        tracing::info!(open = open.len(), "Seeded open extension requests");
        self.publish(&open);
    }

    /// Applies one change to `extension_requests`. Returns whether the
    /// tracked set changed.
    pub fn apply(&self, change: &RowChange) -> bool {
        if change.table != EXTENSION_REQUESTS_TABLE {
            return false;
        }

        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = match change.kind {
            ChangeKind::Delete => change
                .old_record
                .as_ref()
                .or(change.record.as_ref())
                .and_then(request_id)
                .is_some_and(|id| open.remove(&id).is_some()),
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(row) = change.record.as_ref() else {
                    return false;
                };
                match (open_entry(row), request_id(row)) {
                    (Some((id, owner_id)), _) => {
                        open.insert(id, owner_id.clone()).as_ref() != Some(&owner_id)
                    }
                    (None, Some(id)) => open.remove(&id).is_some(),
                    (None, None) => false,
                }
            }
        };

        if changed {
            self.publish(&open);
        }
        changed
    }

    /// Keeps the store in sync with the change feed while the returned
    /// subscription lives.
    pub fn attach(self: &Arc<Self>, feed: &ChangeFeed) -> Subscription {
        let store = Arc::clone(self);
        feed.subscribe(EXTENSION_REQUESTS_TABLE, move |change| {
            store.apply(&change);
        })
    }

    fn publish(&self, open: &HashMap<String, String>) {
        let mut open_by_owner: BTreeMap<String, usize> = BTreeMap::new();
        for owner_id in open.values() {
            *open_by_owner.entry(owner_id.clone()).or_insert(0) += 1;
        }
        let next = ExtensionSnapshot { open_by_owner };
        self.sender.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Replaces the store's contents with the open requests currently in the
/// database. A failed read keeps the current state.
pub async fn reload_open_requests(state: &AppState) {
    let Some(pool) = state.db_pool.as_ref() else {
        return;
    };
    match list_all_rows(
        pool,
        EXTENSION_REQUESTS_TABLE,
        Some(&open_request_filters()),
        state.config.analytics_row_limit,
        "id",
        true,
    )
    .await
    {
        Ok(rows) => state.extension_alerts.seed(&rows),
        Err(error) => {
            tracing::warn!(error = %error, "Could not reload open extension requests");
        }
    }
}

/// Status matches case-insensitively, like [`open_entry`].
fn open_request_filters() -> Map<String, Value> {
    let mut filters = Map::new();
    filters.insert("status__ieq".to_string(), json!(OPEN_STATUS));
    filters
}

fn request_id(row: &Value) -> Option<String> {
    text_field(row, "id")
}

/// `(request id, owner id)` when the row is an open request.
fn open_entry(row: &Value) -> Option<(String, String)> {
    let status = text_field(row, "status")?;
    if !status.eq_ignore_ascii_case(OPEN_STATUS) {
        return None;
    }
    let owner_id = text_field(row, "landlord_id").or_else(|| text_field(row, "owner_id"))?;
    Some((request_id(row)?, owner_id))
}

fn text_field(row: &Value, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn request(id: &str, owner: &str, status: &str) -> Value {
        json!({ "id": id, "landlord_id": owner, "status": status })
    }

    fn upsert(kind: ChangeKind, row: Value) -> RowChange {
        RowChange {
            table: EXTENSION_REQUESTS_TABLE.to_string(),
            kind,
            record: Some(row),
            old_record: None,
        }
    }

    #[test]
    fn seeds_only_open_requests() {
        let store = ExtensionAlertStore::new();
        store.seed(&[
            request("r1", "owner-a", "pending"),
            request("r2", "owner-a", "Pending"),
            request("r3", "owner-b", "approved"),
            json!({ "id": "r4", "status": "pending" }),
        ]);

        assert_eq!(store.snapshot().open_count("owner-a"), 2);
        assert_eq!(store.snapshot().open_count("owner-b"), 0);
    }

    #[test]
    fn reload_matches_status_case_insensitively() {
        let filters = open_request_filters();
        assert_eq!(filters.get("status__ieq"), Some(&json!("pending")));
        assert_eq!(filters.len(), 1);

        let store = ExtensionAlertStore::new();
        store.seed(&[request("r1", "owner-a", "PENDING")]);
        assert_eq!(store.snapshot().open_count("owner-a"), 1);
    }

    #[tokio::test]
    async fn reload_without_database_keeps_state() {
        let state = AppState::with_pool(crate::config::AppConfig::default(), None);
        state.extension_alerts.seed(&[request("r1", "owner-a", "pending")]);
        reload_open_requests(&state).await;
        assert_eq!(state.extension_alerts.snapshot().open_count("owner-a"), 1);
    }

    #[test]
    fn tracks_inserts_updates_and_deletes() {
        let store = ExtensionAlertStore::new();
        let mut receiver = store.subscribe();

        assert!(store.apply(&upsert(ChangeKind::Insert, request("r1", "owner-a", "pending"))));
        assert!(store.snapshot().open_count("owner-a") > 0);
        assert!(receiver.has_changed().unwrap_or(false));
        receiver.mark_unchanged();

        // Same row again: nothing new to report.
        assert!(!store.apply(&upsert(ChangeKind::Update, request("r1", "owner-a", "pending"))));
        assert!(!receiver.has_changed().unwrap_or(true));

        assert!(store.apply(&upsert(ChangeKind::Update, request("r1", "owner-a", "approved"))));
        assert_eq!(store.snapshot().open_count("owner-a"), 0);

        store.apply(&upsert(ChangeKind::Insert, request("r2", "owner-a", "pending")));
        let deletion = RowChange {
            table: EXTENSION_REQUESTS_TABLE.to_string(),
            kind: ChangeKind::Delete,
            record: None,
            old_record: Some(json!({ "id": "r2" })),
        };
        assert!(store.apply(&deletion));
        assert_eq!(store.snapshot(), ExtensionSnapshot::default());
    }

    #[test]
    fn ignores_other_tables() {
        let store = ExtensionAlertStore::new();
        let mut change = upsert(ChangeKind::Insert, request("r1", "owner-a", "pending"));
        change.table = "messages".to_string();
        assert!(!store.apply(&change));
        assert_eq!(store.snapshot().open_count("owner-a"), 0);
    }

    #[tokio::test]
    async fn follows_the_change_feed_while_attached() {
        let feed = ChangeFeed::new(16);
        let store = Arc::new(ExtensionAlertStore::new());
        let mut receiver = store.subscribe();
        let subscription = store.attach(&feed);

        feed.publish(upsert(ChangeKind::Insert, request("r1", "owner-a", "pending")));
        tokio::time::timeout(Duration::from_secs(1), receiver.changed())
            .await
            .expect("store notified")
            .expect("sender alive");
        assert!(receiver.borrow().open_count("owner-a") > 0);

        drop(subscription);
        tokio::time::sleep(Duration::from_millis(20)).await;
        feed.publish(upsert(ChangeKind::Insert, request("r2", "owner-b", "pending")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.snapshot().open_count("owner-b"), 0);
    }
}
