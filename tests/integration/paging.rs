#![allow(missing_docs)]

use std::sync::Arc;

use quarry::config::QueryConfig;
use quarry::query::{parse, Compiler, Executor, PageRequest, QueryPlan};
use quarry::storage::MemoryStore;
use quarry::types::{EntityId, QuarryError, Result, Version};
use serde_json::json;

fn plan(text: &str) -> QueryPlan {
    Compiler::default()
        .plan(&parse(text).expect("parse"))
        .expect("plan")
}

fn scored_store(count: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=count {
        store.insert(EntityId(id), Version(1), json!({ "score": id % 5 }));
    }
    store
}

fn executor(store: &Arc<MemoryStore>) -> Executor {
    let config = QueryConfig {
        scan_page_size: 3,
        ..QueryConfig::default()
    };
    Executor::new(store.clone(), config).with_geo(store.clone())
}

fn ids(raw: impl IntoIterator<Item = u64>) -> Vec<EntityId> {
    raw.into_iter().map(EntityId).collect()
}

async fn drain(
    executor: &Executor,
    plan: &QueryPlan,
    limit: usize,
    descending: bool,
) -> Result<(Vec<EntityId>, usize)> {
    let mut request = PageRequest::first(limit);
    if descending {
        request = request.descending();
    }
    let mut out = Vec::new();
    let mut pages = 0;
    loop {
        let page = executor.page(plan, &request).await?;
        pages += 1;
        out.extend(page.ids);
        match page.cursor {
            Some(cursor) => {
                request = PageRequest::resume(limit, cursor);
                if descending {
                    request = request.descending();
                }
            }
            None => break,
        }
    }
    Ok((out, pages))
}

#[tokio::test]
async fn resumed_pages_cover_the_result_exactly_once() -> Result<()> {
    let store = scored_store(25);
    let executor = executor(&store);
    let plan = plan("score >= 2");
    let expected: Vec<EntityId> = ids((1..=25).filter(|id| id % 5 >= 2));

    let (all, pages) = drain(&executor, &plan, 4, false).await?;
    assert_eq!(all, expected);
    assert_eq!(pages, expected.len().div_ceil(4));
    Ok(())
}

#[tokio::test]
async fn descending_pages_reverse_the_order() -> Result<()> {
    let store = scored_store(25);
    let executor = executor(&store);
    let plan = plan("score = 1 or score = 4");
    let mut expected: Vec<EntityId> = ids((1..=25).filter(|id| id % 5 == 1 || id % 5 == 4));
    expected.reverse();

    let (all, _) = drain(&executor, &plan, 3, true).await?;
    assert_eq!(all, expected);
    Ok(())
}

#[tokio::test]
async fn last_full_page_has_no_cursor_when_nothing_follows() -> Result<()> {
    let store = scored_store(10);
    let executor = executor(&store);
    let page = executor
        .page(&plan("score = 0"), &PageRequest::first(2))
        .await?;
    assert_eq!(page.ids, ids([5, 10]));
    assert_eq!(page.cursor, None);
    Ok(())
}

#[tokio::test]
async fn cursor_is_bound_to_its_plan_and_order() -> Result<()> {
    let store = scored_store(20);
    let executor = executor(&store);
    let first = executor
        .page(&plan("score >= 1"), &PageRequest::first(2))
        .await?;
    let cursor = first.cursor.expect("more pages");

    let err = executor
        .page(&plan("score >= 2"), &PageRequest::resume(2, cursor.clone()))
        .await
        .expect_err("foreign cursor");
    assert!(matches!(err, QuarryError::InvalidCursor(_)));

    let err = executor
        .page(
            &plan("score >= 1"),
            &PageRequest::resume(2, cursor).descending(),
        )
        .await
        .expect_err("order mismatch");
    assert!(matches!(err, QuarryError::InvalidCursor(_)));

    let err = executor
        .page(&plan("score >= 1"), &PageRequest::resume(2, "not-a-cursor"))
        .await
        .expect_err("garbage cursor");
    assert!(matches!(err, QuarryError::InvalidCursor(_)));
    Ok(())
}

#[tokio::test]
async fn negation_subtracts_from_its_sibling_or_from_everything() -> Result<()> {
    let store = scored_store(15);
    let executor = executor(&store);

    let (and_not, _) = drain(&executor, &plan("score >= 1 and not score = 3"), 5, false).await?;
    assert_eq!(and_not, ids((1..=15).filter(|id| matches!(id % 5, 1 | 2 | 4))));

    let (bare_not, _) = drain(&executor, &plan("not score = 0"), 5, false).await?;
    assert_eq!(bare_not, ids((1..=15).filter(|id| id % 5 != 0)));
    Ok(())
}

#[tokio::test]
async fn unfiltered_query_scans_every_id() -> Result<()> {
    let store = scored_store(7);
    let executor = executor(&store);
    let (all, _) = drain(&executor, &plan("select *"), 10, false).await?;
    assert_eq!(all, ids(1..=7));
    Ok(())
}

#[tokio::test]
async fn within_returns_points_inside_the_radius() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.insert(EntityId(1), Version(1), json!({"loc": {"lat": 59.91, "lon": 10.75}}));
    store.insert(
        EntityId(2),
        Version(1),
        json!({"loc": {"latitude": 59.92, "longitude": 10.75}}),
    );
    store.insert(EntityId(3), Version(1), json!({"loc": {"lat": 60.39, "lon": 5.32}}));
    store.insert(EntityId(4), Version(1), json!({"name": "no location"}));
    let executor = executor(&store);

    let page = executor
        .page(&plan("loc within 2000 of 59.91, 10.75"), &PageRequest::first(10))
        .await?;
    assert_eq!(page.ids, ids([1, 2]));

    let without_geo = Executor::new(store.clone(), QueryConfig::default());
    let err = without_geo
        .page(&plan("loc within 2000 of 59.91, 10.75"), &PageRequest::first(10))
        .await
        .expect_err("no geo index");
    assert!(matches!(err, QuarryError::Unsupported(_)));
    Ok(())
}

#[tokio::test]
async fn storage_failure_surfaces_instead_of_a_short_page() {
    let store = scored_store(10);
    let executor = executor(&store);
    store.set_unavailable(true);
    let err = executor
        .page(&plan("score >= 0"), &PageRequest::first(5))
        .await
        .expect_err("unavailable");
    assert!(err.is_retriable());
}

#[tokio::test]
async fn largest_ids_survive_negation_and_unfiltered_scans() -> Result<()> {
    let store = scored_store(4);
    let top = EntityId(u64::MAX);
    store.insert(top, Version(1), json!({"score": 3}));
    store.insert(EntityId(u64::MAX - 4), Version(1), json!({"score": 0}));
    let executor = executor(&store);

    let (all, _) = drain(&executor, &plan("select *"), 2, false).await?;
    assert_eq!(all.len(), 6);
    assert_eq!(all.last(), Some(&top));

    let (kept, _) = drain(&executor, &plan("not score = 0"), 2, true).await?;
    assert_eq!(kept, vec![top, EntityId(4), EntityId(3), EntityId(2), EntityId(1)]);
    Ok(())
}

#[tokio::test]
async fn boolean_filters_page_like_any_other_range() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=6 {
        store.insert(EntityId(id), Version(1), json!({ "intersect": id % 2 == 0 }));
    }
    let executor = executor(&store);
    let (even, pages) = drain(&executor, &plan("intersect = true"), 2, false).await?;
    assert_eq!(even, ids([2, 4, 6]));
    assert_eq!(pages, 2);
    Ok(())
}

#[tokio::test]
async fn order_by_is_left_to_the_search_index() -> Result<()> {
    let store = scored_store(3);
    let err = executor(&store)
        .page(&plan("score >= 0 order by score"), &PageRequest::first(5))
        .await
        .expect_err("range scans follow id order");
    assert!(matches!(err, QuarryError::Unsupported(_)));
    Ok(())
}
