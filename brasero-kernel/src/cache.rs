/**
 * TIERED CACHE - Cache à namespaces indépendants
 *
 * RÔLE : Source de vérité des valeurs "courantes" pour tout le pipeline.
 * Chaque namespace est une map TTL séparée avec son propre budget de fraîcheur :
 * l'éviction d'un namespace ne peut pas déborder sur un autre (isolation
 * structurelle, pas par convention de préfixe).
 *
 * FONCTIONNEMENT :
 * - set() rafraîchit toujours expires_at depuis l'instant d'écriture
 * - get() évince paresseusement une entrée périmée (lecture après TTL = miss)
 * - un sweep périodique borne la staleness à TTL + un intervalle de sweep
 * - incr() (compteurs de rate-limit) n'étend PAS l'expiration : la fenêtre
 *   de limitation doit se refermer, le compteur expire atomiquement
 *
 * NAMESPACES : tokens (heures, invalidation explicite au logout), live
 * (dizaines de secondes), status (~1min), rollups (minutes), rate (fenêtre
 * de limitation), subscribers (durée de vie d'une connexion).
 */

use crate::config::CacheConf;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub expires_at: Instant,
}

pub struct Namespace {
    name: &'static str,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Namespace {
    fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set(&self, key: &str, value: serde_json::Value) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().insert(key.to_string(), entry);
    }

    /// Helper typé par-dessus set().
    pub fn set_t<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => self.set(key, v),
            Err(e) => eprintln!("[cache] {}: serialize failed for '{key}': {e}", self.name),
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut map = self.entries.lock();
        match map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                // périmée : éviction paresseuse, lecture = miss
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn get_t<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Invalidation explicite (logout, teardown). Idempotent.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Compteur monotone à fenêtre : créé avec l'expiration de la fenêtre,
    /// incrémenté SANS la rafraîchir. Retourne la valeur après incrément.
    pub fn incr(&self, key: &str) -> u64 {
        let mut map = self.entries.lock();
        let now = Instant::now();
        match map.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                let n = entry.value.as_u64().unwrap_or(0) + 1;
                entry.value = serde_json::Value::from(n);
                n
            }
            _ => {
                map.insert(
                    key.to_string(),
                    CacheEntry {
                        value: serde_json::Value::from(1u64),
                        expires_at: now + self.ttl,
                    },
                );
                1
            }
        }
    }

    /// Rafraîchit l'expiration sans toucher la valeur (bookkeeping subscribers).
    pub fn touch(&self, key: &str) -> bool {
        let mut map = self.entries.lock();
        match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Instant::now() + self.ttl;
                true
            }
            None => false,
        }
    }

    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut map = self.entries.lock();
        let before = map.len();
        map.retain(|_, e| e.expires_at > now);
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Arène des namespaces. Champs publics : chaque composant parle directement
/// au namespace qui le concerne, il n'y a pas de routage par nom à traverser.
pub struct CacheHub {
    pub tokens: Namespace,
    pub live: Namespace,
    pub status: Namespace,
    pub rollups: Namespace,
    pub rate: Namespace,
    pub subscribers: Namespace,
    sweep_interval: Duration,
}

impl CacheHub {
    pub fn new(conf: &CacheConf) -> Arc<Self> {
        Arc::new(Self {
            tokens: Namespace::new("tokens", Duration::from_secs(conf.tokens_ttl_secs)),
            live: Namespace::new("live", Duration::from_secs(conf.live_ttl_secs)),
            status: Namespace::new("status", Duration::from_secs(conf.status_ttl_secs)),
            rollups: Namespace::new("rollups", Duration::from_secs(conf.rollups_ttl_secs)),
            rate: Namespace::new("rate", Duration::from_secs(conf.rate_window_secs)),
            subscribers: Namespace::new("subscribers", Duration::from_secs(conf.subscribers_ttl_secs)),
            sweep_interval: Duration::from_secs(conf.sweep_interval_secs.max(1)),
        })
    }

    fn namespaces(&self) -> [&Namespace; 6] {
        [
            &self.tokens,
            &self.live,
            &self.status,
            &self.rollups,
            &self.rate,
            &self.subscribers,
        ]
    }

    /// Sweep périodique : aucun namespace ne dépasse son budget de staleness
    /// de plus d'un intervalle de sweep.
    pub fn spawn_sweeper(hub: Arc<CacheHub>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.sweep_interval);
            loop {
                interval.tick().await;
                let mut evicted = 0;
                for ns in hub.namespaces() {
                    evicted += ns.sweep();
                }
                if evicted > 0 {
                    println!("[cache] sweep evicted {evicted} entries");
                }
            }
        });
    }

    /// Clé canonique d'une lecture live.
    pub fn live_key(device_id: &str, channel_id: &str) -> String {
        format!("{device_id}/{channel_id}")
    }
}
