use std::sync::Arc;
use std::time::Duration;

use linkage_telemetry::{SharedStageTimings, StageTimingLayer};
use tracing::{Instrument, info_span};
use tracing_subscriber::layer::SubscriberExt;

#[tokio::test]
async fn instrumented_futures_are_timed() {
    let storage = Arc::new(SharedStageTimings::new());
    let subscriber =
        tracing_subscriber::registry().with(StageTimingLayer::new(storage.clone()));
    let _guard = tracing::subscriber::set_default(subscriber);

    async { tokio::time::sleep(Duration::from_millis(20)).await }
        .instrument(info_span!("linkage.stage", stage = "blocking"))
        .await;
    async {}.instrument(info_span!("linkage.stage", stage = "scoring")).await;

    assert_eq!(storage.stages(), vec!["blocking".to_string(), "scoring".to_string()]);

    let blocking = storage.for_stage("blocking");
    assert_eq!(blocking.len(), 1);
    assert!(blocking[0].elapsed >= Duration::from_millis(20));
    // Sleeping is not time spent polled.
    assert!(blocking[0].busy < blocking[0].elapsed);
    assert_eq!(storage.total("blocking"), blocking[0].elapsed);
}

#[test]
fn timings_serialize_to_json() {
    let storage = Arc::new(SharedStageTimings::new());
    let subscriber =
        tracing_subscriber::registry().with(StageTimingLayer::new(storage.clone()));
    tracing::subscriber::with_default(subscriber, || {
        let _span = info_span!("linkage.stage", stage = "clustering", clusters = 3u64).entered();
    });

    let json = serde_json::to_value(storage.all()).unwrap();
    assert_eq!(json[0]["stage"], "clustering");
    assert_eq!(json[0]["attributes"]["clusters"], 3);
}
