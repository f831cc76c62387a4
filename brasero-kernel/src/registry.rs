/**
 * DEVICE REGISTRY - Catalogue des devices et de leurs sondes
 *
 * RÔLE : Vue read-mostly des devices connus : seedés depuis la config au boot,
 * enregistrables dynamiquement via MQTT (topic register@v1). Le registre
 * appartient conceptuellement à un collaborateur externe; le kernel n'en
 * garde qu'une copie read-through, cachée sous le namespace status avec son
 * propre TTL.
 *
 * FONCTIONNEMENT : map sous RwLock (écritures rares, lectures partout),
 * last_seen + statut de connectivité mis à jour par le pipeline de poll,
 * marquage degraded quand la source d'un device échoue.
 */

use crate::cache::CacheHub;
use crate::config::{ChannelConf, DeviceConf};
use crate::models::{
    Channel, ConnectionStatus, ConnectivityStatus, DeviceRegisterIn, ProbeKind, TempUnit,
};
use crate::state::{new_rw, SharedRw};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub name: String,
    pub channels: Vec<Channel>,
    pub status: ConnectivityStatus,
    pub registered_at: OffsetDateTime,
}

pub struct DeviceRegistry {
    devices: SharedRw<HashMap<String, DeviceEntry>>,
    cache: Arc<CacheHub>,
}

fn meta_key(device_id: &str) -> String {
    format!("meta/{device_id}")
}

impl DeviceRegistry {
    pub fn from_config(devices: &HashMap<String, DeviceConf>, cache: Arc<CacheHub>) -> Self {
        let now = OffsetDateTime::now_utc();
        let map = devices
            .iter()
            .map(|(id, conf)| {
                (
                    id.clone(),
                    DeviceEntry {
                        device_id: id.clone(),
                        name: conf.name.clone(),
                        channels: conf.channels.iter().map(channel_from_conf).collect(),
                        status: ConnectivityStatus {
                            battery_pct: 100.0,
                            signal_pct: 0.0,
                            connection: ConnectionStatus::Offline,
                            last_seen: now,
                        },
                        registered_at: now,
                    },
                )
            })
            .collect::<HashMap<_, _>>();
        println!("[registry] seeded {} devices from config", map.len());
        Self {
            devices: new_rw(map),
            cache,
        }
    }

    /// Enregistrement dynamique (device réel qui s'annonce sur MQTT).
    /// Ré-enregistrer un device connu remet à jour nom et channels.
    pub async fn handle_register(&self, msg: DeviceRegisterIn) {
        let now = OffsetDateTime::now_utc();
        let entry = DeviceEntry {
            device_id: msg.device_id.clone(),
            name: msg.name,
            channels: msg
                .channels
                .iter()
                .map(|c| Channel {
                    channel_id: c.id.clone(),
                    label: c.label.clone().unwrap_or_else(|| c.id.clone()),
                    kind: c.kind,
                    unit: c.unit,
                })
                .collect(),
            status: ConnectivityStatus {
                battery_pct: 100.0,
                signal_pct: 0.0,
                connection: ConnectionStatus::Online,
                last_seen: now,
            },
            registered_at: now,
        };
        println!("[registry] registered device {} ({} channels)", msg.device_id, entry.channels.len());
        self.cache.status.set_t(&meta_key(&msg.device_id), &entry);
        self.devices.write().await.insert(msg.device_id, entry);
    }

    /// Lecture read-through : cache d'abord, sinon la map, en recachant.
    pub async fn get_device(&self, device_id: &str) -> Option<DeviceEntry> {
        if let Some(entry) = self.cache.status.get_t::<DeviceEntry>(&meta_key(device_id)) {
            return Some(entry);
        }
        let entry = self.devices.read().await.get(device_id).cloned()?;
        self.cache.status.set_t(&meta_key(device_id), &entry);
        Some(entry)
    }

    pub async fn list(&self) -> Vec<DeviceEntry> {
        let mut entries: Vec<DeviceEntry> = self.devices.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        entries
    }

    /// Statut frais produit par le pipeline : map + namespace status + meta recaché.
    pub async fn update_status(&self, device_id: &str, status: ConnectivityStatus) {
        let mut map = self.devices.write().await;
        if let Some(entry) = map.get_mut(device_id) {
            entry.status = status.clone();
            self.cache.status.set_t(device_id, &status);
            self.cache.status.set_t(&meta_key(device_id), entry);
        }
    }

    /// Échec de source : statut degraded, last_seen inchangé (on garde la
    /// dernière bonne valeur, l'erreur ne remonte pas plus loin).
    pub async fn mark_degraded(&self, device_id: &str) {
        let mut map = self.devices.write().await;
        if let Some(entry) = map.get_mut(device_id) {
            entry.status.connection = ConnectionStatus::Degraded;
            self.cache.status.set_t(device_id, &entry.status);
            self.cache.status.set_t(&meta_key(device_id), entry);
        }
    }
}

fn channel_from_conf(conf: &ChannelConf) -> Channel {
    Channel {
        channel_id: conf.id.clone(),
        label: conf.label.clone(),
        kind: conf.kind,
        unit: conf.unit,
    }
}

/// Fabrique les devices simulés par défaut quand la config n'en déclare aucun :
/// un fumoir deux sondes, pour que le kernel démarre avec quelque chose à montrer.
pub fn default_devices() -> HashMap<String, DeviceConf> {
    use crate::config::SourceConf;
    let mut devices = HashMap::new();
    devices.insert(
        "grill-1".to_string(),
        DeviceConf {
            name: "Fumoir principal".to_string(),
            channels: vec![
                ChannelConf {
                    id: "probe-1".to_string(),
                    label: "Viande".to_string(),
                    kind: ProbeKind::Food,
                    unit: TempUnit::Fahrenheit,
                },
                ChannelConf {
                    id: "pit".to_string(),
                    label: "Chambre".to_string(),
                    kind: ProbeKind::Ambient,
                    unit: TempUnit::Fahrenheit,
                },
            ],
            source: SourceConf::Simulated,
        },
    );
    devices
}
