/**
 * STREAM DISPATCHER - Distribution temps réel vers les dashboards
 *
 * RÔLE : Une souscription logique par (client, device). Au subscribe le client
 * reçoit immédiatement le snapshot courant (lectures live + status + alertes
 * firing) reconstruit depuis le cache - jamais plus vieux que le TTL du
 * namespace live - puis chaque update du device dans l'ordre de production.
 *
 * FONCTIONNEMENT : un canal broadcast borné par device. Un consommateur lent
 * perd les updates les plus anciennes (sémantique lagged du broadcast) : le
 * producteur n'attend jamais, un dashboard gelé ne peut pas caler la
 * simulation ni le chemin d'écriture cache. Aucune garantie d'ordre entre
 * devices, FIFO strict au sein d'un device.
 *
 * Le bookkeeping des souscriptions vit dans le namespace subscribers du cache;
 * son TTL est rafraîchi tant que la connexion vit, et l'entrée expire seule
 * après un disconnect.
 */

use crate::alerts::AlertEvaluator;
use crate::cache::CacheHub;
use crate::models::{
    fmt_rfc3339, AlertNotification, ChannelSnapshot, ConnectionStatus, ConnectivityStatus,
    DeviceSnapshot, Reading, StatusSnapshot, TempUnit,
};
use crate::registry::DeviceRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Snapshot(DeviceSnapshot),
    Reading {
        channel_id: String,
        temperature: f64,
        unit: TempUnit,
        timestamp: String,
    },
    Status {
        battery: f32,
        signal: f32,
        connection_status: ConnectionStatus,
        timestamp: String,
    },
    Alert(AlertNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub seq: u64,
    #[serde(flatten)]
    pub event: StreamEvent,
}

/// Bookkeeping d'une souscription (namespace subscribers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberEntry {
    pub client_id: String,
    pub device_id: String,
    pub subscribed_at: String,
    pub last_ack: u64,
}

struct DeviceStream {
    tx: broadcast::Sender<StreamUpdate>,
    seq: u64,
}

pub struct StreamSubscription {
    pub client_id: String,
    pub device_id: String,
    pub rx: broadcast::Receiver<StreamUpdate>,
    pub snapshot: StreamUpdate,
}

pub struct StreamHub {
    streams: Mutex<HashMap<String, DeviceStream>>,
    capacity: usize,
    cache: Arc<CacheHub>,
}

impl StreamHub {
    pub fn new(cache: Arc<CacheHub>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            capacity: capacity.max(2),
            cache,
        })
    }

    /// Publie une update pour un device. Numérotée, FIFO par device; sans
    /// souscripteur l'update est simplement perdue (pas d'historique ici).
    pub fn publish(&self, device_id: &str, event: StreamEvent) -> u64 {
        let mut streams = self.streams.lock();
        let stream = streams
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceStream {
                tx: broadcast::channel(self.capacity).0,
                seq: 0,
            });
        stream.seq += 1;
        let update = StreamUpdate { seq: stream.seq, event };
        // send échoue seulement sans receiver : pas une erreur ici
        let _ = stream.tx.send(update);
        stream.seq
    }

    /// Snapshot courant d'un device, reconstruit depuis le cache uniquement.
    pub async fn snapshot(
        &self,
        device_id: &str,
        registry: &DeviceRegistry,
        alerts: &AlertEvaluator,
        now: OffsetDateTime,
    ) -> Option<DeviceSnapshot> {
        let device = registry.get_device(device_id).await?;
        let channels = device
            .channels
            .iter()
            .map(|ch| {
                let reading: Option<Reading> = self
                    .cache
                    .live
                    .get_t(&CacheHub::live_key(device_id, &ch.channel_id));
                ChannelSnapshot {
                    channel_id: ch.channel_id.clone(),
                    temperature: reading.as_ref().map(|r| r.temperature),
                    unit: reading.as_ref().map(|r| r.unit).unwrap_or(ch.unit),
                    connected: reading.is_some(),
                }
            })
            .collect();
        let status: ConnectivityStatus = self
            .cache
            .status
            .get_t(device_id)
            .unwrap_or_else(|| device.status.clone());
        Some(DeviceSnapshot {
            timestamp: fmt_rfc3339(now),
            channels,
            status: StatusSnapshot {
                battery: status.battery_pct,
                signal: status.signal_pct,
                connection_status: status.connection,
            },
            firing_alerts: alerts.firing_for(Some(device_id)),
        })
    }

    /// Crée la souscription : snapshot immédiat + receiver sur le flux du
    /// device + entrée de bookkeeping. `None` si le device est inconnu.
    pub async fn subscribe(
        &self,
        client_id: &str,
        device_id: &str,
        registry: &DeviceRegistry,
        alerts: &AlertEvaluator,
        now: OffsetDateTime,
    ) -> Option<StreamSubscription> {
        // device inconnu : pas de souscription, pas de flux créé
        registry.get_device(device_id).await?;
        // le receiver est créé AVANT la construction du snapshot : une update
        // qui arrive entre les deux sera vue deux fois (snapshot + flux),
        // jamais perdue
        let (rx, seq) = {
            let mut streams = self.streams.lock();
            let stream = streams
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceStream {
                    tx: broadcast::channel(self.capacity).0,
                    seq: 0,
                });
            (stream.tx.subscribe(), stream.seq)
        };
        let snapshot = self.snapshot(device_id, registry, alerts, now).await?;
        self.cache.subscribers.set_t(
            client_id,
            &SubscriberEntry {
                client_id: client_id.to_string(),
                device_id: device_id.to_string(),
                subscribed_at: fmt_rfc3339(now),
                last_ack: 0,
            },
        );
        println!("[stream] client {client_id} subscribed to {device_id}");
        Some(StreamSubscription {
            client_id: client_id.to_string(),
            device_id: device_id.to_string(),
            rx,
            snapshot: StreamUpdate {
                seq,
                event: StreamEvent::Snapshot(snapshot),
            },
        })
    }

    /// Ack client : avance last_ack et rafraîchit le TTL du bookkeeping.
    pub fn ack(&self, client_id: &str, seq: u64) {
        if let Some(mut entry) = self.cache.subscribers.get_t::<SubscriberEntry>(client_id) {
            if seq > entry.last_ack {
                entry.last_ack = seq;
            }
            self.cache.subscribers.set_t(client_id, &entry);
        }
    }

    /// Signal de vie : la connexion tient, le bookkeeping ne doit pas expirer.
    pub fn touch(&self, client_id: &str) {
        self.cache.subscribers.touch(client_id);
    }

    /// Teardown : libère le bookkeeping tout de suite et élague les flux
    /// sans receiver. Idempotent.
    pub fn drop_subscription(&self, client_id: &str) {
        if self.cache.subscribers.remove(client_id) {
            println!("[stream] client {client_id} unsubscribed");
        }
        self.streams.lock().retain(|_, s| s.tx.receiver_count() > 0);
    }

    pub fn subscriber_count(&self) -> usize {
        self.cache.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheHub;
    use crate::config::CacheConf;
    use crate::registry::{default_devices, DeviceRegistry};

    fn fixture() -> (Arc<CacheHub>, Arc<DeviceRegistry>, Arc<AlertEvaluator>, Arc<StreamHub>) {
        let cache = CacheHub::new(&CacheConf::default());
        let registry = Arc::new(DeviceRegistry::from_config(&default_devices(), Arc::clone(&cache)));
        let alerts = Arc::new(AlertEvaluator::from_config(&[]).unwrap());
        let hub = StreamHub::new(Arc::clone(&cache), 4);
        (cache, registry, alerts, hub)
    }

    fn reading(temp: f64) -> Reading {
        Reading {
            device_id: "grill-1".into(),
            channel_id: "probe-1".into(),
            ts: OffsetDateTime::now_utc(),
            temperature: temp,
            unit: TempUnit::Fahrenheit,
        }
    }

    #[tokio::test]
    async fn subscribe_replays_current_snapshot() {
        let (cache, registry, alerts, hub) = fixture();
        cache.live.set_t("grill-1/probe-1", &reading(152.0));

        let sub = hub
            .subscribe("client-1", "grill-1", &registry, &alerts, OffsetDateTime::now_utc())
            .await
            .unwrap();
        match sub.snapshot.event {
            StreamEvent::Snapshot(ref snap) => {
                let probe = snap
                    .channels
                    .iter()
                    .find(|c| c.channel_id == "probe-1")
                    .unwrap();
                assert_eq!(probe.temperature, Some(152.0));
                assert!(probe.connected);
                // le channel sans lecture est présent mais déconnecté
                let pit = snap.channels.iter().find(|c| c.channel_id == "pit").unwrap();
                assert!(!pit.connected);
            }
            _ => panic!("snapshot attendu"),
        }
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn unknown_device_yields_no_subscription() {
        let (_, registry, alerts, hub) = fixture();
        assert!(hub
            .subscribe("client-1", "mystery", &registry, &alerts, OffsetDateTime::now_utc())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn updates_arrive_in_production_order() {
        let (_, registry, alerts, hub) = fixture();
        let mut sub = hub
            .subscribe("client-1", "grill-1", &registry, &alerts, OffsetDateTime::now_utc())
            .await
            .unwrap();
        for temp in [150.0, 151.0, 152.0] {
            hub.publish(
                "grill-1",
                StreamEvent::Reading {
                    channel_id: "probe-1".into(),
                    temperature: temp,
                    unit: TempUnit::Fahrenheit,
                    timestamp: String::new(),
                },
            );
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let update = sub.rx.recv().await.unwrap();
            if let StreamEvent::Reading { temperature, .. } = update.event {
                seen.push(temperature);
            }
        }
        assert_eq!(seen, vec![150.0, 151.0, 152.0]);
    }

    #[tokio::test]
    async fn slow_consumer_drops_oldest_not_producer() {
        let (_, registry, alerts, hub) = fixture();
        // capacité 4 : on publie 10 updates sans consommer
        let mut sub = hub
            .subscribe("client-1", "grill-1", &registry, &alerts, OffsetDateTime::now_utc())
            .await
            .unwrap();
        for i in 0..10 {
            hub.publish(
                "grill-1",
                StreamEvent::Reading {
                    channel_id: "probe-1".into(),
                    temperature: 150.0 + i as f64,
                    unit: TempUnit::Fahrenheit,
                    timestamp: String::new(),
                },
            );
        }
        // le retard se paie en updates anciennes perdues, pas en blocage
        match sub.rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 6),
            other => panic!("lag attendu, reçu {other:?}"),
        }
        // la suite du flux reste lisible, la plus récente en dernier
        let mut last = None;
        while let Ok(update) = sub.rx.try_recv() {
            if let StreamEvent::Reading { temperature, .. } = update.event {
                last = Some(temperature);
            }
        }
        assert_eq!(last, Some(159.0));
    }

    #[tokio::test]
    async fn ack_and_teardown_update_bookkeeping() {
        let (cache, registry, alerts, hub) = fixture();
        let _sub = hub
            .subscribe("client-1", "grill-1", &registry, &alerts, OffsetDateTime::now_utc())
            .await
            .unwrap();
        hub.ack("client-1", 5);
        let entry: SubscriberEntry = cache.subscribers.get_t("client-1").unwrap();
        assert_eq!(entry.last_ack, 5);

        hub.drop_subscription("client-1");
        assert!(cache.subscribers.get("client-1").is_none());
        hub.drop_subscription("client-1"); // idempotent
    }
}
