#![allow(missing_docs)]

use std::sync::Arc;

use quarry::config::{QueryConfig, ReconcileConfig};
use quarry::pipeline::{AssignVersion, CommitEntity, VersionClock, WritePipeline};
use quarry::query::{parse, Compiler, PageRequest, QueryPlan};
use quarry::reconcile::Reconciler;
use quarry::storage::{
    Candidate, DeindexEntry, MemorySearchIndex, MemoryStore, RecordBody, SearchIndex, SearchScope,
};
use quarry::types::{EntityId, Result, Version};
use serde_json::json;

fn scope() -> SearchScope {
    SearchScope::new("app", "pets")
}

fn plan(text: &str) -> QueryPlan {
    Compiler::default()
        .plan(&parse(text).expect("parse"))
        .expect("plan")
}

fn record_ids(records: &[quarry::reconcile::VerifiedRecord]) -> Vec<u64> {
    records.iter().map(|r| r.id.0).collect()
}

#[tokio::test]
async fn stale_candidate_is_dropped_and_deindexed_once() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    store.insert(EntityId(1), Version(2), json!({"kind": "cat"}));
    index
        .index(&scope(), EntityId(1), Version(1), &json!({"kind": "cat"}))
        .await?;
    let reconciler = Reconciler::new(store.clone(), index.clone());

    let candidates = [
        Candidate::new(EntityId(1), Version(1)),
        Candidate::new(EntityId(1), Version(1)),
    ];
    let out = reconciler.reconcile(&candidates, &scope()).await?;
    assert!(out.records.is_empty());
    assert_eq!(
        index.deindex_batches(),
        vec![vec![DeindexEntry {
            id: EntityId(1),
            version: Version(1),
        }]]
    );
    assert!(index.versions(&scope(), EntityId(1)).is_empty());
    Ok(())
}

#[tokio::test]
async fn missing_record_is_dropped_without_deindexing() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    store.insert(EntityId(2), Version(1), json!({"kind": "dog"}));
    let reconciler = Reconciler::new(store, index.clone());

    let out = reconciler
        .reconcile(
            &[
                Candidate::new(EntityId(1), Version(1)),
                Candidate::new(EntityId(2), Version(1)),
            ],
            &scope(),
        )
        .await?;
    assert_eq!(record_ids(&out.records), vec![2]);
    assert_eq!(out.stats.missing, 1);
    assert!(index.deindex_batches().is_empty());
    Ok(())
}

#[tokio::test]
async fn deindex_failure_fails_the_read() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    store.insert(EntityId(1), Version(5), json!({}));
    index.set_unavailable(true);
    let reconciler = Reconciler::new(store, index);

    let err = reconciler
        .reconcile(&[Candidate::new(EntityId(1), Version(4))], &scope())
        .await
        .expect_err("deindex unavailable");
    assert!(err.is_retriable());
    Ok(())
}

#[tokio::test]
async fn search_pulls_candidate_pages_until_the_page_fills() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    for id in 1..=6 {
        store.insert(EntityId(id), Version(2), json!({"kind": "cat", "n": id}));
        let indexed = if id <= 3 { Version(1) } else { Version(2) };
        index
            .index(&scope(), EntityId(id), indexed, &json!({"kind": "cat", "n": id}))
            .await?;
    }
    let reconciler = Reconciler::new(store, index.clone());
    let plan = plan("select n where kind = 'cat'");

    let first = reconciler
        .search(&plan, &scope(), &PageRequest::first(2))
        .await?;
    assert_eq!(record_ids(&first.records), vec![4, 5]);
    assert_eq!(first.records[0].payload, json!({"n": 4}));
    assert_eq!(first.candidate_pages, 3);
    assert_eq!(first.stats.stale, 3);
    assert_eq!(index.deindex_batches().iter().map(Vec::len).sum::<usize>(), 3);

    let cursor = first.cursor.expect("a sixth record remains");
    let second = reconciler
        .search(&plan, &scope(), &PageRequest::resume(2, cursor))
        .await?;
    assert_eq!(record_ids(&second.records), vec![6]);
    assert_eq!(second.cursor, None);
    Ok(())
}

#[tokio::test]
async fn candidate_page_budget_bounds_one_search() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    for id in 1..=10 {
        store.insert(EntityId(id), Version(9), json!({"kind": "cat"}));
        index
            .index(&scope(), EntityId(id), Version(1), &json!({"kind": "cat"}))
            .await?;
    }
    let reconciler = Reconciler::new(store, index).with_config(
        QueryConfig::default(),
        ReconcileConfig {
            max_candidate_pages: 2,
        },
    );

    let page = reconciler
        .search(&plan("kind = 'cat'"), &scope(), &PageRequest::first(2))
        .await?;
    assert!(page.records.is_empty());
    assert_eq!(page.candidate_pages, 2);
    assert!(page.cursor.is_some());
    Ok(())
}

#[tokio::test]
async fn lagging_index_is_corrected_on_read() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    let clock = Arc::new(VersionClock::new());
    let indexed = WritePipeline::standard(clock.clone(), store.clone(), index.clone());
    let unindexed = WritePipeline::new()
        .with_stage(AssignVersion::new(clock))
        .with_stage(CommitEntity::new(store.clone()));

    indexed
        .write(scope(), EntityId(1), RecordBody::Payload(json!({"kind": "cat"})))
        .await?;
    indexed
        .write(scope(), EntityId(2), RecordBody::Payload(json!({"kind": "cat"})))
        .await?;
    unindexed
        .write(scope(), EntityId(1), RecordBody::Payload(json!({"kind": "dog"})))
        .await?;

    let reconciler = Reconciler::new(store, index.clone());
    let page = reconciler
        .search(&plan("kind = 'cat'"), &scope(), &PageRequest::first(10))
        .await?;
    assert_eq!(record_ids(&page.records), vec![2]);
    assert_eq!(page.stats.stale, 1);
    assert!(index.versions(&scope(), EntityId(1)).is_empty());
    Ok(())
}

async fn drain(
    reconciler: &Reconciler,
    plan: &QueryPlan,
    limit: usize,
) -> Result<Vec<Vec<u64>>> {
    let mut pages = Vec::new();
    let mut request = PageRequest::first(limit);
    loop {
        let page = reconciler.search(plan, &scope(), &request).await?;
        pages.push(record_ids(&page.records));
        match page.cursor {
            Some(cursor) => request = PageRequest::resume(limit, cursor),
            None => return Ok(pages),
        }
    }
}

#[tokio::test]
async fn versions_split_across_candidate_pages_are_all_seen() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    store.insert(EntityId(1), Version(2), json!({"kind": "cat"}));
    store.insert(EntityId(2), Version(1), json!({"kind": "cat"}));
    for (id, version) in [(1, 1), (1, 2), (2, 1)] {
        index
            .index(&scope(), EntityId(id), Version(version), &json!({"kind": "cat"}))
            .await?;
    }
    let reconciler = Reconciler::new(store, index.clone());

    let pages = drain(&reconciler, &plan("select * where kind = 'cat'"), 1).await?;
    let ids: Vec<u64> = pages.into_iter().flatten().collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(index.versions(&scope(), EntityId(1)), vec![Version(2)]);
    Ok(())
}

#[tokio::test]
async fn candidate_page_with_repeated_ids_does_not_end_the_search() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    store.insert(EntityId(1), Version(2), json!({"kind": "cat"}));
    for id in [2, 3] {
        store.insert(EntityId(id), Version(1), json!({"kind": "cat"}));
    }
    for (id, version) in [(1, 1), (1, 2), (2, 1), (3, 1)] {
        index
            .index(&scope(), EntityId(id), Version(version), &json!({"kind": "cat"}))
            .await?;
    }
    let reconciler = Reconciler::new(store, index);

    let pages = drain(&reconciler, &plan("kind = 'cat'"), 2).await?;
    assert_eq!(pages, vec![vec![1, 2], vec![3]]);
    Ok(())
}

#[tokio::test]
async fn order_by_pages_follow_the_sort_key() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    let pets = [(1, 4), (2, 9), (3, 1), (4, 9), (5, 6)];
    for (id, age) in pets {
        store.insert(EntityId(id), Version(2), json!({"kind": "dog", "age": age}));
        index
            .index(&scope(), EntityId(id), Version(2), &json!({"kind": "dog", "age": age}))
            .await?;
    }
    // stale row that would sort first if it were trusted
    index
        .index(&scope(), EntityId(3), Version(1), &json!({"kind": "dog", "age": 99}))
        .await?;
    let reconciler = Reconciler::new(store, index);

    let by_age = plan("select age where kind = 'dog' order by age desc");
    let pages = drain(&reconciler, &by_age, 2).await?;
    assert_eq!(pages, vec![vec![2, 4], vec![5, 1], vec![3]]);

    let first = reconciler
        .search(&by_age, &scope(), &PageRequest::first(2).descending())
        .await?;
    assert_eq!(record_ids(&first.records), vec![3, 1]);
    assert_eq!(first.records[0].payload, json!({"age": 1}));
    Ok(())
}

#[tokio::test]
async fn cursor_from_another_ordering_is_rejected() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemorySearchIndex::new());
    for id in 1..=3 {
        store.insert(EntityId(id), Version(1), json!({"age": id}));
        index
            .index(&scope(), EntityId(id), Version(1), &json!({"age": id}))
            .await?;
    }
    let reconciler = Reconciler::new(store, index);
    let page = reconciler
        .search(&plan("age > 0 order by age"), &scope(), &PageRequest::first(1))
        .await?;
    let cursor = page.cursor.expect("more pets follow");

    let err = reconciler
        .search(&plan("age > 0 order by age desc"), &scope(), &PageRequest::resume(1, cursor))
        .await
        .expect_err("cursor bound to the ascending plan");
    assert!(matches!(err, quarry::types::QuarryError::InvalidCursor(_)));
    Ok(())
}
