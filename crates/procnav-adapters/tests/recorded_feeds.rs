use std::path::{Path, PathBuf};
use std::sync::Arc;

use procnav_adapters::{FeedContext, FeedFormat, FeedRegistry, FeedsFile, ALL_FETCH_KEYS};
use procnav_core::{FeedKind, FeedStatus, FetchKey, UNASSIGNED_ENTITY};
use procnav_storage::{HttpClientConfig, HttpFetcher};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn recorded_registry() -> FeedRegistry {
    let root = workspace_root();
    let file = FeedsFile::load(root.join("fixtures/feeds.fixtures.yaml")).unwrap();
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    FeedRegistry::from_feeds_file(&file, http, &root).unwrap()
}

fn ctx() -> FeedContext {
    FeedContext::new(chrono_tz::Europe::Madrid)
}

#[test]
fn shipped_feeds_yaml_is_a_complete_mapping() {
    let root = workspace_root();
    let file = FeedsFile::load(root.join("feeds.yaml")).unwrap();
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    let registry = FeedRegistry::from_feeds_file(&file, http, &root).unwrap();
    for key in ALL_FETCH_KEYS {
        let feed = registry.feed_for(key).unwrap();
        assert_eq!(feed.format(), FeedFormat::JsonApi);
    }
}

#[tokio::test]
async fn recorded_pages_normalize_through_fixture_mapping() {
    let registry = recorded_registry();
    let key = FetchKey::new(FeedKind::Works, FeedStatus::Open);
    let feed = registry.feed_for(key).unwrap();
    assert_eq!(feed.format(), FeedFormat::Fixture);
    assert_eq!(feed.page_size(), 3);

    let page = feed.fetch_page(&ctx(), key, 0).await.unwrap();
    let ids: Vec<_> = page.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["2026-OB-0101", "2026-OB-0102", "2026-OB-0103"]);
    assert_eq!(page[0].region_code.as_deref(), Some("20"));
    assert_eq!(page[1].budget_ex_vat, Some(98000.0));
    assert_eq!(page[2].entity_name, "Aguas del Añarbe");
}

#[tokio::test]
async fn pages_past_the_recording_are_empty() {
    let registry = recorded_registry();
    let key = FetchKey::new(FeedKind::Services, FeedStatus::Open);
    let feed = registry.feed_for(key).unwrap();
    assert!(feed.fetch_page(&ctx(), key, 7).await.unwrap().is_empty());
}

#[tokio::test]
async fn idless_items_are_dropped_and_authority_codes_mapped() {
    let registry = recorded_registry();

    let closed = FetchKey::new(FeedKind::Services, FeedStatus::Closed);
    let page = registry
        .feed_for(closed)
        .unwrap()
        .fetch_page(&ctx(), closed, 0)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, "2025-SE-0801");

    let open = FetchKey::new(FeedKind::Services, FeedStatus::Open);
    let page = registry
        .feed_for(open)
        .unwrap()
        .fetch_page(&ctx(), open, 0)
        .await
        .unwrap();
    let getxo = page.iter().find(|r| r.id == "2026-SE-0203").unwrap();
    assert_eq!(getxo.authority_region_code.as_deref(), Some("48"));
    assert_ne!(getxo.entity_name, UNASSIGNED_ENTITY);
}
