//! In-process queue store.
//!
//! Mirrors the PostgreSQL contract: claimed rows are locked per transaction
//! and other transactions skip them. A transaction sees its own locked rows
//! and uncommitted writes, much like `FOR UPDATE` inside one Postgres
//! transaction. Writes reach other transactions only on commit, and a
//! dropped transaction releases its locks.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{check_transition, ClaimFilter, ItemUpdate, QueueStore, QueueTx, StoreError};
use crate::model::{ItemId, NewOutreachItem, OutreachItem, OutreachStatus};
use crate::notes;

#[derive(Debug, Default)]
struct State {
    // insertion order doubles as the tie-breaker for equal timestamps
    rows: Vec<OutreachItem>,
    locks: HashMap<ItemId, u64>,
    next_tx: u64,
}

impl State {
    fn row_mut(&mut self, id: &ItemId) -> Option<&mut OutreachItem> {
        self.rows.iter_mut().find(|r| r.id == *id)
    }

    fn release(&mut self, tx_id: u64) {
        self.locks.retain(|_, owner| *owner != tx_id);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    state: Arc<Mutex<State>>,
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item: NewOutreachItem) -> ItemId {
        let id = ItemId::new();
        let now = Utc::now();
        lock_state(&self.state).rows.push(OutreachItem {
            id,
            company_name: item.company_name,
            contact_email: item.contact_email,
            status: item.status.unwrap_or(OutreachStatus::Qualified),
            email_subject: item.email_subject,
            email_body: item.email_body,
            notes: item.notes,
            created_at: now,
            updated_at: now,
            sent_at: None,
        });
        id
    }

    pub fn get(&self, id: &ItemId) -> Option<OutreachItem> {
        lock_state(&self.state)
            .rows
            .iter()
            .find(|r| r.id == *id)
            .cloned()
    }

    pub fn all(&self) -> Vec<OutreachItem> {
        lock_state(&self.state).rows.clone()
    }

    /// Number of rows currently held by open transactions.
    pub fn locked_count(&self) -> usize {
        lock_state(&self.state).locks.len()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn begin(&self) -> Result<Box<dyn QueueTx>, StoreError> {
        let tx_id = {
            let mut st = lock_state(&self.state);
            st.next_tx += 1;
            st.next_tx
        };
        Ok(Box::new(MemoryQueueTx {
            state: Arc::clone(&self.state),
            tx_id,
            pending: Vec::new(),
            open: true,
        }))
    }
}

pub struct MemoryQueueTx {
    state: Arc<Mutex<State>>,
    tx_id: u64,
    pending: Vec<(ItemId, ItemUpdate)>,
    open: bool,
}

impl MemoryQueueTx {
    /// The row as this transaction sees it, own uncommitted writes included.
    fn view(&self, row: &OutreachItem) -> OutreachItem {
        let mut row = row.clone();
        let row_id = row.id;
        for (_, change) in self.pending.iter().filter(|(id, _)| *id == row_id) {
            apply(&mut row, change.clone());
        }
        row
    }

    fn finish(&mut self) {
        if self.open {
            lock_state(&self.state).release(self.tx_id);
            self.open = false;
        }
    }
}

impl Drop for MemoryQueueTx {
    fn drop(&mut self) {
        self.finish();
    }
}

fn apply(row: &mut OutreachItem, change: ItemUpdate) {
    row.status = change.status;
    if let Some(subject) = change.email_subject {
        row.email_subject = Some(subject);
    }
    if let Some(body) = change.email_body {
        row.email_body = Some(body);
    }
    if change.sent_at.is_some() {
        row.sent_at = change.sent_at;
    }
    row.updated_at = change.updated_at;
    if let Some(note) = change.append_note {
        row.notes = Some(notes::append(row.notes.as_deref(), &note));
    }
}

#[async_trait]
impl QueueTx for MemoryQueueTx {
    async fn claim(&mut self, filter: &ClaimFilter) -> Result<Vec<OutreachItem>, StoreError> {
        let mut st = lock_state(&self.state);
        let tx_id = self.tx_id;
        let mut batch: Vec<OutreachItem> = st
            .rows
            .iter()
            .filter(|r| st.locks.get(&r.id).map_or(true, |owner| *owner == tx_id))
            .map(|r| self.view(r))
            .filter(|r| filter.matches(r))
            .collect();
        batch.sort_by_key(|r| filter.order.value_of(r));
        batch.truncate(filter.limit);
        for item in &batch {
            st.locks.insert(item.id, self.tx_id);
        }
        Ok(batch)
    }

    async fn update(&mut self, id: &ItemId, change: ItemUpdate) -> Result<(), StoreError> {
        check_transition(id, &change)?;
        let st = lock_state(&self.state);
        let row = st
            .rows
            .iter()
            .find(|r| r.id == *id)
            .ok_or(StoreError::Conflict {
                id: *id,
                expected: change.expected,
            })?;
        let current = self
            .pending
            .iter()
            .rev()
            .find(|(pid, _)| pid == id)
            .map_or(row.status, |(_, c)| c.status);
        let held_elsewhere = st.locks.get(id).is_some_and(|owner| *owner != self.tx_id);
        if current != change.expected || held_elsewhere {
            return Err(StoreError::Conflict {
                id: *id,
                expected: change.expected,
            });
        }
        drop(st);
        self.pending.push((*id, change));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        let pending = std::mem::take(&mut this.pending);
        {
            let mut st = lock_state(&this.state);
            for (id, change) in pending {
                if let Some(row) = st.row_mut(&id) {
                    apply(row, change);
                }
            }
            st.release(this.tx_id);
        }
        this.open = false;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut this = self;
        this.pending.clear();
        this.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::OrderKey;

    fn qualified(filter_limit: usize) -> ClaimFilter {
        ClaimFilter::new(OutreachStatus::Qualified, OrderKey::CreatedAt, filter_limit)
    }

    #[tokio::test]
    async fn claim_skips_rows_locked_by_other_tx() {
        let store = MemoryQueueStore::new();
        for n in 0..3 {
            store.insert(NewOutreachItem::qualified(&format!("c{n}"), None));
        }

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        let first = a.claim(&qualified(2)).await.unwrap();
        let second = b.claim(&qualified(2)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(first.iter().all(|i| i.id != second[0].id));
        assert_eq!(first[0].company_name, "c0");
        assert_eq!(second[0].company_name, "c2");
    }

    #[tokio::test]
    async fn dropped_tx_releases_locks_and_discards_writes() {
        let store = MemoryQueueStore::new();
        let id = store.insert(NewOutreachItem::qualified("Acme", None));
        {
            let mut tx = store.begin().await.unwrap();
            let batch = tx.claim(&qualified(5)).await.unwrap();
            assert_eq!(batch.len(), 1);
            tx.update(
                &id,
                ItemUpdate::advance(
                    OutreachStatus::Qualified,
                    OutreachStatus::DraftReady,
                    Utc::now(),
                ),
            )
            .await
            .unwrap();
            assert_eq!(store.locked_count(), 1);
        }
        assert_eq!(store.locked_count(), 0);
        assert_eq!(store.get(&id).unwrap().status, OutreachStatus::Qualified);
    }

    #[tokio::test]
    async fn update_rejects_regression_and_stale_status() {
        let store = MemoryQueueStore::new();
        let id = store.insert(NewOutreachItem::draft_ready(Some("a@b.io"), "s", "b"));
        let mut tx = store.begin().await.unwrap();
        let back = ItemUpdate::advance(
            OutreachStatus::DraftReady,
            OutreachStatus::Qualified,
            Utc::now(),
        );
        assert!(matches!(
            tx.update(&id, back).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        let stale = ItemUpdate::advance(
            OutreachStatus::Qualified,
            OutreachStatus::DraftReady,
            Utc::now(),
        );
        assert!(matches!(
            tx.update(&id, stale).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn claim_sees_own_locks_and_pending_writes() {
        let store = MemoryQueueStore::new();
        let ids: Vec<_> = (0..2)
            .map(|n| store.insert(NewOutreachItem::qualified(&format!("c{n}"), None)))
            .collect();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.claim(&qualified(5)).await.unwrap().len(), 2);
        let again: Vec<_> = tx
            .claim(&qualified(5))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(again, ids);

        tx.update(
            &ids[0],
            ItemUpdate::advance(
                OutreachStatus::Qualified,
                OutreachStatus::DraftReady,
                Utc::now(),
            ),
        )
        .await
        .unwrap();
        let left = tx.claim(&qualified(5)).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, ids[1]);
        assert_eq!(store.locked_count(), 2);
    }

    #[tokio::test]
    async fn commit_appends_notes() {
        let store = MemoryQueueStore::new();
        let id = store.insert(
            NewOutreachItem::draft_ready(Some("a@b.io"), "s", "b").with_notes("seed"),
        );
        let mut tx = store.begin().await.unwrap();
        tx.update(
            &id,
            ItemUpdate::annotate(OutreachStatus::DraftReady, "\nSend=fail".into(), Utc::now()),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            store.get(&id).unwrap().notes.as_deref(),
            Some("seed\nSend=fail")
        );
    }
}
