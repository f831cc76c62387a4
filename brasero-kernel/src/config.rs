use crate::models::{ProbeKind, TempUnit};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tokio::fs;

/// Configuration complète du kernel. Tout ce qui est réglable l'est ici :
/// TTLs par namespace, cadence de poll, probabilités d'events, règles d'alertes,
/// fenêtre de rate-limit. Rien n'est codé en dur dans le pipeline.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub devices: HashMap<String, DeviceConf>,
    /// Profils additionnels déclarés en YAML, fusionnés avec la bibliothèque embarquée.
    pub profiles: HashMap<String, ProfileConf>,
    pub poll: PollConf,
    pub cache: CacheConf,
    pub events: EventConf,
    pub alerts: Vec<AlertRuleConf>,
    pub stream: StreamConf,
    pub rate_limit: RateLimitConf,
    pub sim: SimConf,
    pub history: HistoryConf,
    pub mqtt: Option<MqttConf>,
    pub http_port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConf {
    pub name: String,
    pub channels: Vec<ChannelConf>,
    #[serde(default)]
    pub source: SourceConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChannelConf {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    #[serde(default = "default_unit")]
    pub unit: TempUnit,
}

fn default_unit() -> TempUnit {
    TempUnit::Fahrenheit
}

/// Provenance des lectures d'un device, choisie à la construction du pipeline.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConf {
    #[default]
    Simulated,
    Remote {
        base_url: String,
        #[serde(default = "default_remote_timeout")]
        timeout_secs: u64,
    },
}

fn default_remote_timeout() -> u64 {
    4
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PollConf {
    /// Cadence de poll par device, en secondes.
    pub interval_secs: u64,
    /// La connectivité (batterie/signal) avance tous les N ticks de poll.
    pub status_every_ticks: u32,
}

impl Default for PollConf {
    fn default() -> Self {
        Self { interval_secs: 5, status_every_ticks: 6 }
    }
}

/// Budgets de fraîcheur par namespace du cache étagé.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConf {
    pub tokens_ttl_secs: u64,
    pub live_ttl_secs: u64,
    pub status_ttl_secs: u64,
    pub rollups_ttl_secs: u64,
    /// TTL des compteurs = fenêtre de rate-limit.
    pub rate_window_secs: u64,
    pub subscribers_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConf {
    fn default() -> Self {
        Self {
            tokens_ttl_secs: 4 * 3600,
            live_ttl_secs: 30,
            status_ttl_secs: 60,
            rollups_ttl_secs: 300,
            rate_window_secs: 60,
            subscribers_ttl_secs: 90,
            sweep_interval_secs: 15,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EventConf {
    /// Espérance d'events spontanés (lid-open...) par heure et par session.
    pub random_per_hour: f64,
}

impl Default for EventConf {
    fn default() -> Self {
        Self { random_per_hour: 4.0 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AlertRuleConf {
    pub id: String,
    pub device_id: Option<String>,
    pub channel_id: Option<String>,
    pub kind: AlertKindConf,
    #[serde(default)]
    pub threshold: f64,
    pub debounce_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertKindConf {
    High,
    Low,
    Disconnect,
    Battery,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StreamConf {
    /// Capacité du buffer sortant par device; un consommateur lent perd
    /// les updates les plus anciennes, jamais le producteur.
    pub buffer: usize,
    pub idle_timeout_secs: u64,
}

impl Default for StreamConf {
    fn default() -> Self {
        Self { buffer: 64, idle_timeout_secs: 300 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConf {
    /// Requêtes autorisées par appelant sur une fenêtre `cache.rate_window_secs`.
    pub max_requests: u64,
}

impl Default for RateLimitConf {
    fn default() -> Self {
        Self { max_requests: 120 }
    }
}

/// Bornes physiques de la simulation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SimConf {
    pub ambient_floor_f: f64,
    pub hard_ceiling_f: f64,
    pub start_temp_f: f64,
    /// Signal en dessous duquel le device est vu offline pour le tick.
    pub signal_threshold_pct: f32,
}

impl Default for SimConf {
    fn default() -> Self {
        Self {
            ambient_floor_f: 35.0,
            hard_ceiling_f: 650.0,
            start_temp_f: 40.0,
            signal_threshold_pct: 25.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConf {
    /// Profondeur de la file de forwarding vers le store historique.
    pub queue: usize,
}

impl Default for HistoryConf {
    fn default() -> Self {
        Self { queue: 256 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

/// Déclaration YAML d'un profil de cuisson (mêmes champs que profiles::Phase).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProfileConf {
    pub phases: Vec<PhaseConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PhaseConf {
    pub name: String,
    pub target_f: f64,
    pub rate_min: f64,
    pub rate_max: f64,
    pub min_secs: u64,
    pub max_secs: u64,
    pub noise_amp: f64,
    #[serde(default = "default_epsilon")]
    pub exit_epsilon: f64,
}

fn default_epsilon() -> f64 {
    2.0
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            profiles: HashMap::new(),
            poll: PollConf::default(),
            cache: CacheConf::default(),
            events: EventConf::default(),
            alerts: Vec::new(),
            stream: StreamConf::default(),
            rate_limit: RateLimitConf::default(),
            sim: SimConf::default(),
            history: HistoryConf::default(),
            mqtt: Some(MqttConf { host: "localhost".into(), port: 1883 }),
            http_port: 8080,
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("BRASERO_KERNEL_CONFIG").unwrap_or_else(|_| "brasero.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            eprintln!("[config] config invalide: {e}");
            KernelConfig::default()
        })
    } else {
        eprintln!("[config] pas de brasero.yaml, usage config par défaut");
        KernelConfig::default()
    }
}
