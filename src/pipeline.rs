//! Stage definitions and the pass orchestrator.
//!
//! A pass claims work from the queue, runs every claimed item through one
//! stage, and commits according to that stage's policy:
//! - drafting commits the whole claimed batch at once, or nothing;
//! - sending claims, processes and commits one item at a time. The throttle
//!   interval separates consecutive dispatch attempts; items that never reach
//!   the transport are not paced, and the pass never sleeps before it ends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::db::{ClaimFilter, ItemUpdate, OrderKey, QueueStore, QueueTx, StoreError};
use crate::dispatch::{DispatchError, Dispatcher, Mailbox, OutgoingMessage};
use crate::model::{FailureCategory, ItemId, OutreachItem, OutreachStatus};
use crate::notes::{NoteEntry, NoteFilter};
use crate::render::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// One transaction for the whole claimed batch.
    PerBatch,
    /// One transaction per item, committed before the next claim.
    PerItem,
}

#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub name: &'static str,
    pub precondition: OutreachStatus,
    pub postcondition: OutreachStatus,
    pub order: OrderKey,
    pub commit: CommitPolicy,
    pub require_draft: bool,
    pub note_filter: Option<NoteFilter>,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("rendered draft for {0} has an empty subject or body")]
    EmptyDraft(ItemId),
}

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Stage(#[from] StageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Advanced,
    Failed(FailureCategory),
}

/// What a stage decided for one item: the row change plus its classification.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub update: ItemUpdate,
    pub outcome: Outcome,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn definition(&self) -> &StageDefinition;

    /// Decide the change for one claimed item. Item-local failures are
    /// reported through [`Outcome::Failed`]; an `Err` aborts the pass.
    async fn process(
        &self,
        item: &OutreachItem,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome, StageError>;

    /// Whether processing `item` goes through a rate-limited transport.
    fn paced(&self, _item: &OutreachItem) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl PassSummary {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }

    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Advanced => self.succeeded += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PassSettings {
    pub batch_size: usize,
    pub throttle: Duration,
}

/// Drives passes against one store.
pub struct Orchestrator<'a> {
    store: &'a dyn QueueStore,
    settings: PassSettings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a dyn QueueStore, settings: PassSettings) -> Self {
        Self { store, settings }
    }

    fn filter(&self, def: &StageDefinition, limit: usize) -> ClaimFilter {
        let mut filter = ClaimFilter::new(def.precondition, def.order, limit);
        filter.require_draft = def.require_draft;
        filter.note_filter = def.note_filter.clone();
        filter
    }

    /// Run one pass of `stage`. An empty queue yields an empty summary.
    #[instrument(skip_all, fields(stage = stage.definition().name))]
    pub async fn run(&self, stage: &dyn Stage) -> Result<PassSummary, PassError> {
        let summary = match stage.definition().commit {
            CommitPolicy::PerBatch => self.run_batched(stage).await?,
            CommitPolicy::PerItem => self.run_per_item(stage).await?,
        };
        if summary.is_empty() {
            info!("nothing to do");
        } else {
            info!(
                claimed = summary.claimed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "pass finished"
            );
        }
        Ok(summary)
    }

    async fn run_batched(&self, stage: &dyn Stage) -> Result<PassSummary, PassError> {
        let def = stage.definition();
        let mut tx = self.store.begin().await?;
        let batch = tx
            .claim(&self.filter(def, self.settings.batch_size))
            .await?;
        if batch.is_empty() {
            tx.rollback().await?;
            return Ok(PassSummary::default());
        }
        info!(claimed = batch.len(), "claimed batch");

        let mut summary = PassSummary {
            claimed: batch.len(),
            ..Default::default()
        };
        for item in &batch {
            if let Err(err) = apply_one(&mut *tx, stage, item, &mut summary).await {
                warn!(item_id = %item.id, ?err, "rolling back batch");
                tx.rollback().await?;
                return Err(err);
            }
        }
        tx.commit().await?;
        Ok(summary)
    }

    async fn run_per_item(&self, stage: &dyn Stage) -> Result<PassSummary, PassError> {
        let def = stage.definition();
        let mut summary = PassSummary::default();
        let mut seen: Vec<ItemId> = Vec::new();
        let mut dispatched = false;

        while summary.claimed < self.settings.batch_size {
            let mut tx = self.store.begin().await?;
            let mut filter = self.filter(def, 1);
            filter.exclude = seen.clone();
            let Some(item) = tx.claim(&filter).await?.into_iter().next() else {
                tx.rollback().await?;
                break;
            };
            seen.push(item.id);
            summary.claimed += 1;

            // the claimed row stays locked through the wait
            let paced = stage.paced(&item);
            if paced && dispatched && !self.settings.throttle.is_zero() {
                debug!(throttle = ?self.settings.throttle, "throttling");
                tokio::time::sleep(self.settings.throttle).await;
            }
            dispatched |= paced;

            if let Err(err) = apply_one(&mut *tx, stage, &item, &mut summary).await {
                warn!(item_id = %item.id, ?err, "aborting pass");
                tx.rollback().await?;
                return Err(err);
            }
            tx.commit().await?;
        }
        Ok(summary)
    }
}

async fn apply_one(
    tx: &mut dyn QueueTx,
    stage: &dyn Stage,
    item: &OutreachItem,
    summary: &mut PassSummary,
) -> Result<(), PassError> {
    let decided = stage.process(item, Utc::now()).await?;
    tx.update(&item.id, decided.update).await?;
    match &decided.outcome {
        Outcome::Advanced => debug!(item_id = %item.id, "advanced"),
        Outcome::Failed(category) => {
            warn!(item_id = %item.id, category = %category, "item failed")
        }
    }
    summary.record(&decided.outcome);
    Ok(())
}

/// `qualified -> draft_ready`, rendering the template per company.
pub struct DraftStage {
    def: StageDefinition,
    template: Template,
    actor: String,
}

impl DraftStage {
    pub fn new(template: Template, actor: &str) -> Self {
        Self {
            def: StageDefinition {
                name: "draft",
                precondition: OutreachStatus::Qualified,
                postcondition: OutreachStatus::DraftReady,
                order: OrderKey::CreatedAt,
                commit: CommitPolicy::PerBatch,
                require_draft: false,
                note_filter: None,
            },
            template,
            actor: actor.to_string(),
        }
    }
}

#[async_trait]
impl Stage for DraftStage {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    async fn process(
        &self,
        item: &OutreachItem,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome, StageError> {
        let email = self.template.render(&item.company_name);
        if email.subject.trim().is_empty() || email.body.trim().is_empty() {
            return Err(StageError::EmptyDraft(item.id));
        }
        let update = ItemUpdate::advance(self.def.precondition, self.def.postcondition, now)
            .with_draft(email.subject, email.body)
            .with_note(NoteEntry::drafted(&self.actor, now).to_appendix());
        Ok(ItemOutcome {
            update,
            outcome: Outcome::Advanced,
        })
    }
}

fn recipient(item: &OutreachItem) -> &str {
    item.contact_email.as_deref().unwrap_or_default().trim()
}

/// Minimal recipient check done before any dispatch attempt.
pub fn is_valid_recipient(addr: &str) -> bool {
    let addr = addr.trim();
    !addr.is_empty() && addr.contains('@')
}

/// `draft_ready -> sent` through a [`Dispatcher`].
pub struct SendStage<'d> {
    def: StageDefinition,
    dispatcher: &'d dyn Dispatcher,
    from: Mailbox,
    reply_to: Option<String>,
    timeout: Duration,
}

impl<'d> SendStage<'d> {
    pub fn new(dispatcher: &'d dyn Dispatcher, from: Mailbox, timeout: Duration) -> Self {
        Self {
            def: StageDefinition {
                name: "send",
                precondition: OutreachStatus::DraftReady,
                postcondition: OutreachStatus::Sent,
                order: OrderKey::UpdatedAt,
                commit: CommitPolicy::PerItem,
                require_draft: true,
                note_filter: None,
            },
            dispatcher,
            from,
            reply_to: None,
            timeout,
        }
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn with_note_filter(mut self, filter: Option<NoteFilter>) -> Self {
        self.def.note_filter = filter;
        self
    }

    fn failed(&self, category: FailureCategory, now: DateTime<Utc>) -> ItemOutcome {
        let note = NoteEntry::send_failed(self.dispatcher.transport(), category, now);
        ItemOutcome {
            update: ItemUpdate::annotate(self.def.precondition, note.to_appendix(), now),
            outcome: Outcome::Failed(category),
        }
    }
}

#[async_trait]
impl<'d> Stage for SendStage<'d> {
    fn definition(&self) -> &StageDefinition {
        &self.def
    }

    fn paced(&self, item: &OutreachItem) -> bool {
        is_valid_recipient(recipient(item))
    }

    async fn process(
        &self,
        item: &OutreachItem,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome, StageError> {
        let to = recipient(item);
        if !is_valid_recipient(to) {
            return Ok(self.failed(FailureCategory::InvalidRecipient, now));
        }

        let message = OutgoingMessage {
            from: self.from.clone(),
            reply_to: self.reply_to.clone(),
            to: to.to_string(),
            subject: item.email_subject.clone().unwrap_or_default(),
            body: item.email_body.clone().unwrap_or_default(),
        };
        let sent = match tokio::time::timeout(self.timeout, self.dispatcher.send(&message)).await
        {
            Ok(res) => res,
            Err(_) => Err(DispatchError::Timeout),
        };

        // stamp after the network call so sent_at reflects delivery time
        let now = Utc::now().max(now);
        match sent {
            Ok(()) => {
                info!(item_id = %item.id, to = %to, "sent");
                let note = NoteEntry::sent(self.dispatcher.transport(), to, now);
                let update = ItemUpdate::advance(self.def.precondition, self.def.postcondition, now)
                    .with_sent_at(now)
                    .with_note(note.to_appendix());
                Ok(ItemOutcome {
                    update,
                    outcome: Outcome::Advanced,
                })
            }
            Err(err) => {
                warn!(item_id = %item.id, to = %to, error = %err, "send failed");
                Ok(self.failed(err.category(), now))
            }
        }
    }
}
