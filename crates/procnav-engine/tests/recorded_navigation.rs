use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use chrono_tz::Europe::Madrid;
use procnav_adapters::{FeedRegistry, FeedsFile};
use procnav_core::{FeedKind, FeedStatus, FetchKey};
use procnav_engine::{
    fetch_deduplicated, EngineConfig, FetchStop, KeywordRules, NavError, NoticeEngine, PagePayload,
    Screen,
};
use procnav_storage::{HttpClientConfig, HttpFetcher, ManualClock};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn recorded_registry() -> FeedRegistry {
    let root = workspace_root();
    let file = FeedsFile::load(root.join("fixtures/feeds.fixtures.yaml")).unwrap();
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    FeedRegistry::from_feeds_file(&file, http, &root).unwrap()
}

fn recorded_engine() -> (NoticeEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()));
    let rules = KeywordRules::from_workspace_root(&workspace_root()).unwrap();
    let engine = NoticeEngine::new(&EngineConfig::default(), recorded_registry(), rules, clock.clone());
    (engine, clock)
}

fn results(screen: Screen) -> PagePayload {
    match screen {
        Screen::Results(page) => page,
        Screen::Menu(menu) => panic!("expected results, got menu {}", menu.title),
    }
}

fn entity_names(page: &PagePayload) -> Vec<&str> {
    page.groups.iter().map(|g| g.entity_name.as_str()).collect()
}

#[tokio::test]
async fn overlapping_pages_dedupe_and_repeated_page_terminates() {
    let registry = recorded_registry();

    let open = FetchKey::new(FeedKind::Works, FeedStatus::Open);
    let feed = registry.feed_for(open).unwrap();
    let outcome = fetch_deduplicated(feed.as_ref(), open, 40, Madrid).await.unwrap();
    assert_eq!(outcome.records.len(), 6);
    assert_eq!(outcome.pages, 3);
    assert_eq!(outcome.stop, FetchStop::ShortPage);

    let closed = FetchKey::new(FeedKind::Works, FeedStatus::Closed);
    let outcome = fetch_deduplicated(feed.as_ref(), closed, 40, Madrid).await.unwrap();
    assert_eq!(outcome.records.len(), 3);
    assert_eq!(outcome.stop, FetchStop::NoNewRecords);
}

#[tokio::test]
async fn general_summary_spans_two_pages() {
    let (engine, _clock) = recorded_engine();
    let first = results(engine.navigate("view:OBRAS:OPEN:GEN:RES").await.unwrap());
    assert_eq!(first.total_groups, 5);
    assert_eq!(first.total_pages, 2);
    assert_eq!(
        entity_names(&first),
        [
            "Aguas del Añarbe",
            "Ayuntamiento de Barakaldo",
            "Ayuntamiento de Tolosa",
            "Ayuntamiento de Vitoria-Gasteiz"
        ]
    );
    assert_eq!(first.groups[2].budget_total, 562000.0);

    let second = results(engine.navigate("sum:OBRAS:OPEN:GEN:1").await.unwrap());
    assert_eq!(entity_names(&second), ["Diputación Foral de Gipuzkoa"]);
}

#[tokio::test]
async fn in_term_gipuzkoa_detail_combines_codes_and_place_names() {
    let (engine, _clock) = recorded_engine();
    let page = results(engine.navigate("view:OBRAS:PLAZO:GIP:DET").await.unwrap());
    assert_eq!(page.total_notices, 4);
    assert_eq!(page.total_groups, 3);
    assert_eq!(entity_names(&page), ["Aguas del Añarbe", "Ayuntamiento de Tolosa"]);

    let tolosa: Vec<_> = page.groups[1].notices.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(tolosa, ["2026-OB-0104", "2026-OB-0101"]);
    assert_eq!(page.groups[1].ordinal, Some(2));

    let next = results(engine.navigate("det:OBRAS:PLAZO:GIP:1").await.unwrap());
    assert_eq!(entity_names(&next), ["Diputación Foral de Gipuzkoa"]);
    assert_eq!(next.groups[0].ordinal, Some(3));
}

#[tokio::test]
async fn engineering_subset_excludes_negative_matches_and_foreign_codes() {
    let (engine, _clock) = recorded_engine();
    let general = results(engine.navigate("view:ING:OPEN:GEN:RES").await.unwrap());
    assert_eq!(
        entity_names(&general),
        ["Ayuntamiento de Getxo", "Diputación Foral de Gipuzkoa"]
    );

    let gipuzkoa = results(engine.navigate("view:ING:OPEN:GIP:RES").await.unwrap());
    assert_eq!(entity_names(&gipuzkoa), ["Diputación Foral de Gipuzkoa"]);
}

#[tokio::test]
async fn recorded_paging_expires_after_browse_ttl() {
    let (engine, clock) = recorded_engine();
    engine.navigate("view:OBRAS:CLOSED:GEN:DET").await.unwrap();
    clock.advance(chrono::Duration::seconds(301));
    assert!(matches!(
        engine.navigate("det:OBRAS:CLOSED:GEN:1").await,
        Err(NavError::CacheExpired { .. })
    ));
}

#[tokio::test]
async fn digest_lists_todays_recorded_works() {
    let (engine, _clock) = recorded_engine();
    let digest = engine.todays_open_notices().await.unwrap();
    let names: Vec<_> = digest.entries.iter().map(|e| e.entity_name.as_str()).collect();
    assert_eq!(
        names,
        [
            "Aguas del Añarbe",
            "Ayuntamiento de Tolosa",
            "Diputación Foral de Gipuzkoa"
        ]
    );
    assert_eq!(digest.notice_count(), 3);
}
