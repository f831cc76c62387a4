//! Tests d'intégration du pipeline write-through : poll -> cache -> alertes ->
//! stream -> (historique, rollups), et le contrat de replay au subscribe.

use brasero_kernel::adapter::{DeviceSource, Pipeline, PollOutcome, SimulatedSource, SourceError};
use brasero_kernel::alerts::AlertEvaluator;
use brasero_kernel::cache::CacheHub;
use brasero_kernel::config::{AlertKindConf, AlertRuleConf, CacheConf, KernelConfig};
use brasero_kernel::history::history_channel;
use brasero_kernel::models::{ConnectionStatus, Reading, TempUnit};
use brasero_kernel::profiles::ProfileLibrary;
use brasero_kernel::registry::{default_devices, DeviceRegistry};
use brasero_kernel::rollup::{RollupSnapshot, RollupTracker};
use brasero_kernel::session::SessionManager;
use brasero_kernel::stream::{StreamEvent, StreamHub, StreamUpdate};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;

struct Fixture {
    cfg: Arc<KernelConfig>,
    pipeline: Arc<Pipeline>,
    simulated: Arc<SimulatedSource>,
    sessions: Arc<SessionManager>,
    history_rx: mpsc::Receiver<Reading>,
}

fn fixture(rules: Vec<AlertRuleConf>) -> Fixture {
    let mut cfg = KernelConfig::default();
    cfg.devices = default_devices();
    cfg.alerts = rules;
    let cfg = Arc::new(cfg);

    let cache = CacheHub::new(&CacheConf::default());
    let registry = Arc::new(DeviceRegistry::from_config(&cfg.devices, Arc::clone(&cache)));
    let alerts = Arc::new(AlertEvaluator::from_config(&cfg.alerts).unwrap());
    let stream = StreamHub::new(Arc::clone(&cache), 32);
    let rollups = RollupTracker::new(60);
    let (history_tx, history_rx) = history_channel(64);
    let sessions = Arc::new(SessionManager::new(
        Arc::new(ProfileLibrary::builtin()),
        cfg.sim.clone(),
        cfg.events.clone(),
    ));
    let simulated = SimulatedSource::new(Arc::clone(&sessions), Arc::clone(&cfg));
    let pipeline = Pipeline::new(
        cache,
        registry,
        alerts,
        stream,
        rollups,
        history_tx,
        None,
        cfg.sim.signal_threshold_pct,
    );
    Fixture { cfg, pipeline, simulated, sessions, history_rx }
}

fn reading(temp: f64, ts: OffsetDateTime) -> Reading {
    Reading {
        device_id: "grill-1".into(),
        channel_id: "probe-1".into(),
        ts,
        temperature: temp,
        unit: TempUnit::Fahrenheit,
    }
}

#[tokio::test]
async fn subscriber_gets_fresh_snapshot_between_ticks() {
    let mut fx = fixture(vec![]);
    let now = OffsetDateTime::now_utc();
    fx.sessions.start("grill-1", "probe-1", "brisket-smoking", now).unwrap();

    // un tick de poll complet via la source simulée
    let device = fx.pipeline.registry.get_device("grill-1").await.unwrap();
    let tick = now + Duration::seconds(5);
    let outcome = fx.simulated.poll(&device, tick).await.unwrap();
    fx.pipeline.ingest_outcome("grill-1", outcome, tick).await;

    // subscribe ENTRE deux ticks producteurs : le snapshot vient du cache,
    // jamais plus vieux que le TTL live
    let sub = fx
        .pipeline
        .stream
        .subscribe("client-1", "grill-1", &fx.pipeline.registry, &fx.pipeline.alerts, tick)
        .await
        .unwrap();
    let StreamEvent::Snapshot(snap) = &sub.snapshot.event else {
        panic!("snapshot attendu");
    };
    let probe = snap.channels.iter().find(|c| c.channel_id == "probe-1").unwrap();
    assert!(probe.connected);
    assert!(probe.temperature.is_some());

    // la lecture forwardée vers l'historique est la même que celle du cache
    let forwarded = fx.history_rx.recv().await.unwrap();
    assert_eq!(forwarded.channel_id, "probe-1");
    assert_eq!(Some(forwarded.temperature), probe.temperature);
}

#[tokio::test]
async fn alert_transitions_reach_subscribers_in_order() {
    let fx = fixture(vec![AlertRuleConf {
        id: "probe-high".into(),
        device_id: None,
        channel_id: Some("probe-1".into()),
        kind: AlertKindConf::High,
        threshold: 200.0,
        debounce_secs: 10,
    }]);
    let t0 = OffsetDateTime::now_utc();

    let mut sub = fx
        .pipeline
        .stream
        .subscribe("client-1", "grill-1", &fx.pipeline.registry, &fx.pipeline.alerts, t0)
        .await
        .unwrap();

    // deux lectures au-dessus du seuil, espacées de plus que le debounce
    for (offset, temp) in [(0, 210.0), (15, 211.0)] {
        let ts = t0 + Duration::seconds(offset);
        fx.pipeline
            .ingest_outcome(
                "grill-1",
                PollOutcome { readings: vec![reading(temp, ts)], status: None },
                ts,
            )
            .await;
    }

    let mut events = Vec::new();
    for _ in 0..3 {
        let update: StreamUpdate = sub.rx.recv().await.unwrap();
        events.push(update);
    }
    // ordre de production : reading, reading, alerte firing
    assert!(matches!(events[0].event, StreamEvent::Reading { .. }));
    assert!(matches!(events[1].event, StreamEvent::Reading { .. }));
    match &events[2].event {
        StreamEvent::Alert(n) => {
            assert_eq!(n.state, "firing");
            assert_eq!(n.rule_kind, "high");
            assert_eq!(n.channel_id.as_deref(), Some("probe-1"));
        }
        other => panic!("alerte attendue, reçu {other:?}"),
    }
    // les seq sont strictement croissants par device
    assert!(events.windows(2).all(|w| w[1].seq == w[0].seq + 1));

    // et l'alerte firing apparaît dans le snapshot d'un nouveau client
    let sub2 = fx
        .pipeline
        .stream
        .subscribe("client-2", "grill-1", &fx.pipeline.registry, &fx.pipeline.alerts, t0)
        .await
        .unwrap();
    let StreamEvent::Snapshot(snap) = &sub2.snapshot.event else {
        panic!("snapshot attendu");
    };
    assert_eq!(snap.firing_alerts.len(), 1);
}

#[tokio::test]
async fn poll_failure_degrades_device_and_notifies_stream() {
    let fx = fixture(vec![]);
    let t0 = OffsetDateTime::now_utc();
    let mut sub = fx
        .pipeline
        .stream
        .subscribe("client-1", "grill-1", &fx.pipeline.registry, &fx.pipeline.alerts, t0)
        .await
        .unwrap();

    fx.pipeline
        .ingest_poll_failure("grill-1", &SourceError::Timeout, t0)
        .await;

    let update = sub.rx.recv().await.unwrap();
    match update.event {
        StreamEvent::Status { connection_status, .. } => {
            assert_eq!(connection_status, ConnectionStatus::Degraded);
        }
        other => panic!("status attendu, reçu {other:?}"),
    }
    let device = fx.pipeline.registry.get_device("grill-1").await.unwrap();
    assert_eq!(device.status.connection, ConnectionStatus::Degraded);
}

#[tokio::test]
async fn rollups_aggregate_on_slower_cadence() {
    let fx = fixture(vec![]);
    let t0 = OffsetDateTime::now_utc();
    for (offset, temp) in [(0, 150.0), (5, 158.0), (10, 154.0)] {
        let ts = t0 + Duration::seconds(offset);
        fx.pipeline
            .ingest_outcome(
                "grill-1",
                PollOutcome { readings: vec![reading(temp, ts)], status: None },
                ts,
            )
            .await;
    }
    // la cadence lente : rien dans le namespace avant le flush
    assert!(fx.pipeline.cache.rollups.get("grill-1/probe-1").is_none());
    fx.pipeline.rollups.flush(&fx.pipeline.cache, t0 + Duration::seconds(60));

    let snap: RollupSnapshot = fx.pipeline.cache.rollups.get_t("grill-1/probe-1").unwrap();
    assert_eq!(snap.min, 150.0);
    assert_eq!(snap.max, 158.0);
    assert_eq!(snap.count, 3);
    assert!((snap.avg - 154.0).abs() < 1e-9);
}

#[tokio::test]
async fn status_sample_below_threshold_is_offline_for_one_tick() {
    let fx = fixture(vec![]);
    let t0 = OffsetDateTime::now_utc();
    let threshold = fx.cfg.sim.signal_threshold_pct;

    fx.pipeline
        .ingest_outcome(
            "grill-1",
            PollOutcome { readings: vec![], status: Some((80.0, threshold - 5.0)) },
            t0,
        )
        .await;
    let device = fx.pipeline.registry.get_device("grill-1").await.unwrap();
    assert_eq!(device.status.connection, ConnectionStatus::Offline);

    // le tick suivant, signal revenu : online à nouveau
    let t1 = t0 + Duration::seconds(30);
    fx.pipeline
        .ingest_outcome(
            "grill-1",
            PollOutcome { readings: vec![], status: Some((80.0, threshold + 20.0)) },
            t1,
        )
        .await;
    let device = fx.pipeline.registry.get_device("grill-1").await.unwrap();
    assert_eq!(device.status.connection, ConnectionStatus::Online);
}
