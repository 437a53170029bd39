//! Runs against a live PostgreSQL only when `OUTREACH_TEST_DATABASE_URL` is set.
use anyhow::Result;
use chrono::Utc;
use std::collections::HashSet;

use outreach_pipeline::db::{self, ClaimFilter, ItemUpdate, OrderKey, PgQueueStore, QueueStore};
use outreach_pipeline::model::{NewOutreachItem, OutreachStatus};
use outreach_pipeline::notes::NoteFilter;

async fn store() -> Result<Option<PgQueueStore>> {
    let Ok(url) = std::env::var("OUTREACH_TEST_DATABASE_URL") else {
        eprintln!("OUTREACH_TEST_DATABASE_URL not set; skipping");
        return Ok(None);
    };
    let pool = sqlx::PgPool::connect(&url).await?;
    db::run_migrations(&pool).await?;
    Ok(Some(PgQueueStore::new(pool)))
}

#[tokio::test]
async fn skip_locked_claims_are_disjoint() -> Result<()> {
    let Some(store) = store().await? else {
        return Ok(());
    };
    // a unique tag keeps this run's rows apart from anything else in the table
    let tag = format!("pg-it-{}", uuid::Uuid::new_v4());
    for i in 0..5 {
        store
            .insert(NewOutreachItem::qualified(&format!("Pg {i}"), None).with_notes(&tag))
            .await?;
    }

    let mut filter = ClaimFilter::new(OutreachStatus::Qualified, OrderKey::CreatedAt, 10);
    filter.note_filter = NoteFilter::parse(Some(&tag));

    let mut a = store.begin().await?;
    let mut b = store.begin().await?;
    let first = a.claim(&filter).await?;
    let second = b.claim(&filter).await?;
    assert_eq!(first.len(), 5);
    assert!(second.is_empty());

    let ids: HashSet<_> = first.iter().map(|i| i.id).collect();
    assert_eq!(ids.len(), 5);

    let now = Utc::now();
    a.update(
        &first[0].id,
        ItemUpdate::advance(OutreachStatus::Qualified, OutreachStatus::DraftReady, now)
            .with_draft("s".into(), "b".into())
            .with_note("\nDraft=ok by=pg-it".into()),
    )
    .await?;
    a.commit().await?;
    b.rollback().await?;

    let row = store.get(&first[0].id).await?.expect("row exists");
    assert_eq!(row.status, OutreachStatus::DraftReady);
    assert_eq!(row.notes.as_deref(), Some(format!("{tag}\nDraft=ok by=pg-it").as_str()));

    // stale expectation is refused
    let mut c = store.begin().await?;
    let stale = c
        .update(
            &first[0].id,
            ItemUpdate::advance(OutreachStatus::Qualified, OutreachStatus::DraftReady, now),
        )
        .await;
    assert!(matches!(stale, Err(db::StoreError::Conflict { .. })));
    c.rollback().await?;
    Ok(())
}
