/**
 * DEVICE ADAPTER - Interface uniforme d'acquisition des lectures
 *
 * RÔLE : Produire périodiquement les lectures d'un device, que la source soit
 * le Session Engine (simulé) ou l'API d'un device réel. Le choix se fait à la
 * construction (une implémentation par provenance), jamais par inspection au
 * runtime : le reste du pipeline ne branche jamais sur l'origine des données.
 *
 * FONCTIONNEMENT :
 * - une task tokio par device, cadence configurable (un poll gelé ne bloque
 *   jamais les autres devices, le timeout est indépendant)
 * - write-through : lecture -> namespace live -> {rollups, historique,
 *   évaluateur d'alertes, stream} dans l'ordre de production
 * - échec de source : on garde la dernière bonne valeur cachée et on marque
 *   le device degraded; rien ne remonte comme erreur aux consommateurs
 */

use crate::alerts::AlertEvaluator;
use crate::cache::CacheHub;
use crate::config::{DeviceConf, KernelConfig, SourceConf};
use crate::models::{
    fmt_rfc3339, AlertNotification, ConnectionStatus, ConnectivityStatus, Reading,
    RemoteReadingsIn, TempUnit,
};
use crate::registry::{DeviceEntry, DeviceRegistry};
use crate::rollup::RollupTracker;
use crate::session::{Advance, SessionManager, StatusSim};
use crate::state::{new_state, Shared};
use crate::stream::{StreamEvent, StreamHub};
use futures::future::BoxFuture;
use rumqttc::{AsyncClient, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("poll timeout")]
    Timeout,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Résultat d'un poll : lectures du tick et, quand l'horloge lente l'a décidé,
/// un échantillon de connectivité.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub readings: Vec<Reading>,
    pub status: Option<(f32, f32)>,
}

/// Capability trait : une implémentation par provenance, interchangeables.
pub trait DeviceSource: Send + Sync {
    fn poll<'a>(
        &'a self,
        device: &'a DeviceEntry,
        now: OffsetDateTime,
    ) -> BoxFuture<'a, Result<PollOutcome, SourceError>>;
}

/// Source simulée : délègue au Session Engine channel par channel. Un channel
/// sans session active ne produit pas de lecture.
pub struct SimulatedSource {
    sessions: Arc<SessionManager>,
    sims: Shared<HashMap<String, (StatusSim, u32)>>,
    cfg: Arc<KernelConfig>,
}

impl SimulatedSource {
    pub fn new(sessions: Arc<SessionManager>, cfg: Arc<KernelConfig>) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            sims: new_state(HashMap::new()),
            cfg,
        })
    }
}

impl DeviceSource for SimulatedSource {
    fn poll<'a>(
        &'a self,
        device: &'a DeviceEntry,
        now: OffsetDateTime,
    ) -> BoxFuture<'a, Result<PollOutcome, SourceError>> {
        Box::pin(async move {
            let mut outcome = PollOutcome::default();
            for ch in &device.channels {
                match self
                    .sessions
                    .advance_channel(&device.device_id, &ch.channel_id, now)
                {
                    Some(Advance::Reading(temperature)) => outcome.readings.push(Reading {
                        device_id: device.device_id.clone(),
                        channel_id: ch.channel_id.clone(),
                        ts: now,
                        temperature,
                        unit: TempUnit::Fahrenheit,
                    }),
                    // Completed est déjà clôturé par le manager; None = pas de session
                    Some(Advance::Completed) | None => {}
                }
            }
            // connectivité sur horloge lente indépendante
            let every = self.cfg.poll.status_every_ticks.max(1);
            let mut sims = self.sims.lock();
            let entry = sims
                .entry(device.device_id.clone())
                .or_insert_with(|| (StatusSim::new(), 0));
            entry.1 = entry.1.wrapping_add(1);
            if entry.1 % every == 0 {
                outcome.status = Some(entry.0.tick(&self.cfg.sim));
            }
            Ok(outcome)
        })
    }
}

/// Source réelle : même forme d'appel contre l'API externe du device, réponse
/// normalisée dans le même type Reading. C'est cette uniformité qui évite au
/// pipeline de brancher sur la provenance.
pub struct RemoteSource {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteSource {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Arc<Self>, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Arc::new(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }))
    }
}

impl DeviceSource for RemoteSource {
    fn poll<'a>(
        &'a self,
        device: &'a DeviceEntry,
        now: OffsetDateTime,
    ) -> BoxFuture<'a, Result<PollOutcome, SourceError>> {
        Box::pin(async move {
            let url = format!("{}/devices/{}/readings", self.base_url, device.device_id);
            let resp = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<RemoteReadingsIn>()
                .await
                .map_err(|e| SourceError::Malformed(e.to_string()))?;

            let mut outcome = PollOutcome::default();
            for r in resp.readings {
                let Some(ch) = device.channels.iter().find(|c| c.channel_id == r.channel_id)
                else {
                    eprintln!(
                        "[adapter] {}: reading for unknown channel '{}'",
                        device.device_id, r.channel_id
                    );
                    continue;
                };
                outcome.readings.push(Reading {
                    device_id: device.device_id.clone(),
                    channel_id: ch.channel_id.clone(),
                    ts: now,
                    // tout le pipeline travaille en °F
                    temperature: r.unit.to_fahrenheit(r.temperature),
                    unit: TempUnit::Fahrenheit,
                });
            }
            if let (Some(b), Some(s)) = (resp.battery_pct, resp.signal_pct) {
                outcome.status = Some((b, s));
            }
            Ok(outcome)
        })
    }
}

/// Construit la source d'un device selon sa config (choix à la construction).
pub fn build_source(
    conf: &DeviceConf,
    simulated: &Arc<SimulatedSource>,
) -> Result<Arc<dyn DeviceSource>, SourceError> {
    match &conf.source {
        SourceConf::Simulated => {
            let source: Arc<dyn DeviceSource> = simulated.clone();
            Ok(source)
        }
        SourceConf::Remote { base_url, timeout_secs } => {
            let source: Arc<dyn DeviceSource> = RemoteSource::new(base_url, *timeout_secs)?;
            Ok(source)
        }
    }
}

/// Le pipeline write-through branché derrière chaque poll.
pub struct Pipeline {
    pub cache: Arc<CacheHub>,
    pub registry: Arc<DeviceRegistry>,
    pub alerts: Arc<AlertEvaluator>,
    pub stream: Arc<StreamHub>,
    pub rollups: Arc<RollupTracker>,
    history_tx: mpsc::Sender<Reading>,
    notifier: Option<AsyncClient>,
    signal_threshold: f32,
}

impl Pipeline {
    pub fn new(
        cache: Arc<CacheHub>,
        registry: Arc<DeviceRegistry>,
        alerts: Arc<AlertEvaluator>,
        stream: Arc<StreamHub>,
        rollups: Arc<RollupTracker>,
        history_tx: mpsc::Sender<Reading>,
        notifier: Option<AsyncClient>,
        signal_threshold: f32,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            registry,
            alerts,
            stream,
            rollups,
            history_tx,
            notifier,
            signal_threshold,
        })
    }

    pub async fn ingest_outcome(&self, device_id: &str, outcome: PollOutcome, now: OffsetDateTime) {
        for reading in outcome.readings {
            self.ingest_reading(reading, now).await;
        }
        if let Some((battery, signal)) = outcome.status {
            self.ingest_status_sample(device_id, battery, signal, now)
                .await;
        }
    }

    /// Une lecture traverse tout : cache live, rollups, forwarding historique,
    /// alertes, stream - dans cet ordre, celui de production.
    async fn ingest_reading(&self, reading: Reading, now: OffsetDateTime) {
        self.cache.live.set_t(
            &CacheHub::live_key(&reading.device_id, &reading.channel_id),
            &reading,
        );
        self.rollups
            .record(&reading.device_id, &reading.channel_id, reading.temperature);

        // fire-and-forget vers le store historique : une file pleine droppe,
        // le chemin live ne ralentit pas
        if self.history_tx.try_send(reading.clone()).is_err() {
            eprintln!("[adapter] history queue full, dropping reading");
        }

        let transitions = self.alerts.observe_reading(&reading, now);
        self.stream.publish(
            &reading.device_id,
            StreamEvent::Reading {
                channel_id: reading.channel_id.clone(),
                temperature: reading.temperature,
                unit: reading.unit,
                timestamp: fmt_rfc3339(reading.ts),
            },
        );
        self.emit_transitions(&reading.device_id, transitions).await;
    }

    /// Échantillon de connectivité : signal sous le seuil = offline pour CE
    /// tick uniquement (le suivant repart de la valeur persistée).
    async fn ingest_status_sample(
        &self,
        device_id: &str,
        battery: f32,
        signal: f32,
        now: OffsetDateTime,
    ) {
        let connection = if signal < self.signal_threshold {
            ConnectionStatus::Offline
        } else {
            ConnectionStatus::Online
        };
        let status = ConnectivityStatus {
            battery_pct: battery,
            signal_pct: signal,
            connection,
            last_seen: now,
        };
        self.registry.update_status(device_id, status.clone()).await;
        let transitions = self.alerts.observe_status(device_id, &status, now);
        self.stream.publish(
            device_id,
            StreamEvent::Status {
                battery,
                signal,
                connection_status: connection,
                timestamp: fmt_rfc3339(now),
            },
        );
        self.emit_transitions(device_id, transitions).await;
    }

    /// Échec de poll : dernière bonne valeur conservée (on ne touche pas au
    /// namespace live), statut degraded, et c'est tout - erreur locale.
    pub async fn ingest_poll_failure(&self, device_id: &str, err: &SourceError, now: OffsetDateTime) {
        eprintln!("[adapter] poll failed for {device_id}: {err}");
        self.registry.mark_degraded(device_id).await;
        if let Some(device) = self.registry.get_device(device_id).await {
            let status = device.status;
            let transitions = self.alerts.observe_status(device_id, &status, now);
            self.stream.publish(
                device_id,
                StreamEvent::Status {
                    battery: status.battery_pct,
                    signal: status.signal_pct,
                    connection_status: status.connection,
                    timestamp: fmt_rfc3339(now),
                },
            );
            self.emit_transitions(device_id, transitions).await;
        }
    }

    /// Transitions firing/resolved : stream + collaborateur de notification.
    async fn emit_transitions(&self, device_id: &str, transitions: Vec<AlertNotification>) {
        for tr in transitions {
            println!(
                "[alerts] {} {} on {}{}",
                tr.rule_kind,
                tr.state,
                tr.device_id,
                tr.channel_id
                    .as_deref()
                    .map(|c| format!("/{c}"))
                    .unwrap_or_default()
            );
            self.stream
                .publish(device_id, StreamEvent::Alert(tr.clone()));
            if let Some(client) = &self.notifier {
                match serde_json::to_string(&tr) {
                    Ok(payload) => {
                        if let Err(e) = client
                            .publish(crate::mqtt::TOPIC_ALERTS, QoS::AtLeastOnce, false, payload)
                            .await
                        {
                            eprintln!("[alerts] failed to publish transition: {e:?}");
                        }
                    }
                    Err(e) => eprintln!("[alerts] serialize transition failed: {e}"),
                }
            }
        }
    }
}

/// Démarre une boucle de poll par device. Chaque boucle a sa propre task et
/// son propre timeout : un device gelé n'affecte que lui.
pub fn spawn_poll_loops(
    cfg: &Arc<KernelConfig>,
    pipeline: &Arc<Pipeline>,
    simulated: &Arc<SimulatedSource>,
) {
    for (device_id, conf) in &cfg.devices {
        let source = match build_source(conf, simulated) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("[adapter] cannot build source for {device_id}: {e}");
                continue;
            }
        };
        spawn_device_loop(
            device_id.clone(),
            source,
            Arc::clone(pipeline),
            cfg.poll.interval_secs.max(1),
        );
    }
    println!(
        "[adapter] polling {} devices every {}s",
        cfg.devices.len(),
        cfg.poll.interval_secs
    );
}

pub fn spawn_device_loop(
    device_id: String,
    source: Arc<dyn DeviceSource>,
    pipeline: Arc<Pipeline>,
    interval_secs: u64,
) {
    tokio::spawn(async move {
        let period = std::time::Duration::from_secs(interval_secs);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now = OffsetDateTime::now_utc();
            let Some(device) = pipeline.registry.get_device(&device_id).await else {
                continue;
            };
            // le timeout borne le tick : jamais plus d'une cadence de retard
            match tokio::time::timeout(period, source.poll(&device, now)).await {
                Ok(Ok(outcome)) => pipeline.ingest_outcome(&device_id, outcome, now).await,
                Ok(Err(e)) => pipeline.ingest_poll_failure(&device_id, &e, now).await,
                Err(_) => {
                    pipeline
                        .ingest_poll_failure(&device_id, &SourceError::Timeout, now)
                        .await
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConf;
    use crate::profiles::ProfileLibrary;
    use crate::registry::default_devices;

    fn fixture() -> (Arc<KernelConfig>, Arc<Pipeline>, Arc<SimulatedSource>, Arc<SessionManager>) {
        let mut cfg = KernelConfig::default();
        cfg.devices = default_devices();
        let cfg = Arc::new(cfg);
        let cache = CacheHub::new(&CacheConf::default());
        let registry = Arc::new(DeviceRegistry::from_config(
            &cfg.devices,
            Arc::clone(&cache),
        ));
        let alerts = Arc::new(AlertEvaluator::from_config(&[]).unwrap());
        let stream = StreamHub::new(Arc::clone(&cache), 16);
        let rollups = RollupTracker::new(60);
        let (tx, mut rx) = mpsc::channel::<Reading>(16);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
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
            tx,
            None,
            cfg.sim.signal_threshold_pct,
        );
        (cfg, pipeline, simulated, sessions)
    }

    #[tokio::test]
    async fn channels_without_session_produce_no_reading() {
        let (_cfg, pipeline, simulated, _sessions) = fixture();
        let device = pipeline.registry.get_device("grill-1").await.unwrap();
        let outcome = simulated
            .poll(&device, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(outcome.readings.is_empty());
    }

    #[tokio::test]
    async fn simulated_poll_writes_through_to_live_cache() {
        let (_cfg, pipeline, simulated, sessions) = fixture();
        let now = OffsetDateTime::now_utc();
        sessions
            .start("grill-1", "probe-1", "brisket-smoking", now)
            .unwrap();

        let device = pipeline.registry.get_device("grill-1").await.unwrap();
        let later = now + time::Duration::seconds(5);
        let outcome = simulated.poll(&device, later).await.unwrap();
        assert_eq!(outcome.readings.len(), 1);
        pipeline.ingest_outcome("grill-1", outcome, later).await;

        let cached: Reading = pipeline
            .cache
            .live
            .get_t(&CacheHub::live_key("grill-1", "probe-1"))
            .unwrap();
        assert_eq!(cached.channel_id, "probe-1");
        assert_eq!(cached.ts, later);
    }

    #[tokio::test]
    async fn reading_timestamps_strictly_increase_per_channel() {
        let (_cfg, pipeline, simulated, sessions) = fixture();
        let mut now = OffsetDateTime::now_utc();
        sessions
            .start("grill-1", "probe-1", "brisket-smoking", now)
            .unwrap();
        let device = pipeline.registry.get_device("grill-1").await.unwrap();

        let mut last_ts = None;
        for _ in 0..10 {
            now += time::Duration::seconds(5);
            let outcome = simulated.poll(&device, now).await.unwrap();
            let reading = &outcome.readings[0];
            if let Some(prev) = last_ts {
                assert!(reading.ts > prev);
            }
            last_ts = Some(reading.ts);
        }
    }

    #[tokio::test]
    async fn poll_failure_marks_degraded_and_keeps_last_reading() {
        let (_cfg, pipeline, simulated, sessions) = fixture();
        let now = OffsetDateTime::now_utc();
        sessions
            .start("grill-1", "probe-1", "brisket-smoking", now)
            .unwrap();
        let device = pipeline.registry.get_device("grill-1").await.unwrap();
        let later = now + time::Duration::seconds(5);
        let outcome = simulated.poll(&device, later).await.unwrap();
        pipeline.ingest_outcome("grill-1", outcome, later).await;

        pipeline
            .ingest_poll_failure("grill-1", &SourceError::Timeout, later)
            .await;

        // dernière bonne valeur toujours servie
        assert!(pipeline
            .cache
            .live
            .get(&CacheHub::live_key("grill-1", "probe-1"))
            .is_some());
        let device = pipeline.registry.get_device("grill-1").await.unwrap();
        assert_eq!(device.status.connection, ConnectionStatus::Degraded);
    }

    #[tokio::test]
    async fn status_clock_is_slower_than_poll_clock() {
        let (cfg, pipeline, simulated, _sessions) = fixture();
        let device = pipeline.registry.get_device("grill-1").await.unwrap();
        let mut samples = 0;
        let mut now = OffsetDateTime::now_utc();
        let ticks = cfg.poll.status_every_ticks * 3;
        for _ in 0..ticks {
            now += time::Duration::seconds(5);
            let outcome = simulated.poll(&device, now).await.unwrap();
            if outcome.status.is_some() {
                samples += 1;
            }
        }
        assert_eq!(samples, 3);
    }
}
