/**
 * ALERT EVALUATOR - Alertes à seuil avec debounce et hystérésis
 *
 * RÔLE : Évaluer chaque nouvelle lecture (ou snapshot de connectivité) contre
 * les règles configurées, et n'émettre que des transitions stables : une règle
 * passe pending dès que sa condition tient, ne devient firing qu'après l'avoir
 * tenue sans interruption pendant toute la fenêtre de debounce, et ne se résout
 * qu'après l'avoir lâchée pendant cette même fenêtre (anti-flapping au seuil).
 *
 * FONCTIONNEMENT : machine à états explicite par instance de règle
 * (idle -> pending -> firing -> resolved -> idle), enum taggé + deux
 * timestamps. Seules firing/resolved sont observables de l'extérieur
 * (stream + collaborateur de notification); pending reste interne.
 *
 * Les règles disconnect/battery s'évaluent sur le status device, pas sur les
 * températures, mais traversent la même machine.
 */

use crate::config::{AlertKindConf, AlertRuleConf};
use crate::models::{fmt_rfc3339, AlertNotification, ConnectionStatus, ConnectivityStatus, Reading};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use time::{Duration, OffsetDateTime};

pub type AlertKind = AlertKindConf;

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("rule '{0}': high/low rules need a channel_id or device_id scope")]
    MissingTempScope(String),
    #[error("rule '{0}': disconnect/battery rules need a device_id scope")]
    MissingDeviceScope(String),
    #[error("rule '{0}': debounce_secs must be > 0")]
    ZeroDebounce(String),
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub id: String,
    pub device_id: Option<String>,
    pub channel_id: Option<String>,
    pub kind: AlertKind,
    pub threshold: f64,
    pub debounce: Duration,
}

impl AlertRule {
    /// Règle malformée = erreur de configuration, rejetée à la création.
    fn from_conf(conf: &AlertRuleConf) -> Result<Self, AlertError> {
        if conf.debounce_secs == 0 {
            return Err(AlertError::ZeroDebounce(conf.id.clone()));
        }
        match conf.kind {
            AlertKindConf::High | AlertKindConf::Low => {
                if conf.channel_id.is_none() && conf.device_id.is_none() {
                    return Err(AlertError::MissingTempScope(conf.id.clone()));
                }
            }
            AlertKindConf::Disconnect | AlertKindConf::Battery => {
                if conf.device_id.is_none() {
                    return Err(AlertError::MissingDeviceScope(conf.id.clone()));
                }
            }
        }
        Ok(Self {
            id: conf.id.clone(),
            device_id: conf.device_id.clone(),
            channel_id: conf.channel_id.clone(),
            kind: conf.kind,
            threshold: conf.threshold,
            debounce: Duration::seconds(conf.debounce_secs as i64),
        })
    }

    fn kind_str(&self) -> &'static str {
        match self.kind {
            AlertKindConf::High => "high",
            AlertKindConf::Low => "low",
            AlertKindConf::Disconnect => "disconnect",
            AlertKindConf::Battery => "battery",
        }
    }

    fn matches_reading(&self, r: &Reading) -> bool {
        match self.kind {
            AlertKindConf::High | AlertKindConf::Low => match &self.channel_id {
                Some(ch) => ch == &r.channel_id,
                None => self.device_id.as_deref() == Some(r.device_id.as_str()),
            },
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Idle,
    Pending,
    Firing,
    Resolved,
}

#[derive(Debug, Clone)]
struct AlertInstance {
    state: AlertState,
    first_observed_at: Option<OffsetDateTime>,
    last_observed_at: Option<OffsetDateTime>,
    device_id: String,
    channel_id: Option<String>,
}

impl AlertInstance {
    fn idle(device_id: &str, channel_id: Option<&str>) -> Self {
        Self {
            state: AlertState::Idle,
            first_observed_at: None,
            last_observed_at: None,
            device_id: device_id.to_string(),
            channel_id: channel_id.map(str::to_string),
        }
    }

    fn reset(&mut self) {
        self.state = AlertState::Idle;
        self.first_observed_at = None;
        self.last_observed_at = None;
    }

    /// Un pas de la machine. Retourne la transition observable, s'il y en a une.
    fn step(&mut self, holds: bool, debounce: Duration, now: OffsetDateTime) -> Option<AlertState> {
        match (self.state, holds) {
            (AlertState::Idle | AlertState::Resolved, true) => {
                self.state = AlertState::Pending;
                self.first_observed_at = Some(now);
                self.last_observed_at = Some(now);
                None
            }
            (AlertState::Idle, false) => None,
            (AlertState::Resolved, false) => {
                self.reset();
                None
            }
            (AlertState::Pending, true) => {
                self.last_observed_at = Some(now);
                let held = now - self.first_observed_at.unwrap_or(now);
                if held >= debounce {
                    self.state = AlertState::Firing;
                    Some(AlertState::Firing)
                } else {
                    None
                }
            }
            (AlertState::Pending, false) => {
                // un échantillon isolé ne déclenche jamais rien
                self.reset();
                None
            }
            (AlertState::Firing, true) => {
                self.last_observed_at = Some(now);
                None
            }
            (AlertState::Firing, false) => {
                let clear_for = now - self.last_observed_at.unwrap_or(now);
                if clear_for >= debounce {
                    self.state = AlertState::Resolved;
                    Some(AlertState::Resolved)
                } else {
                    None
                }
            }
        }
    }
}

pub struct AlertEvaluator {
    rules: Vec<AlertRule>,
    instances: Mutex<HashMap<String, AlertInstance>>,
}

impl AlertEvaluator {
    pub fn from_config(rules: &[AlertRuleConf]) -> Result<Self, AlertError> {
        let rules = rules
            .iter()
            .map(AlertRule::from_conf)
            .collect::<Result<Vec<_>, _>>()?;
        if !rules.is_empty() {
            println!("[alerts] loaded {} rules", rules.len());
        }
        Ok(Self {
            rules,
            instances: Mutex::new(HashMap::new()),
        })
    }

    /// Évalue toutes les règles de température scopées sur cette lecture.
    pub fn observe_reading(&self, r: &Reading, now: OffsetDateTime) -> Vec<AlertNotification> {
        let mut out = Vec::new();
        let mut instances = self.instances.lock();
        for rule in self.rules.iter().filter(|rule| rule.matches_reading(r)) {
            let holds = match rule.kind {
                AlertKindConf::High => r.temperature > rule.threshold,
                AlertKindConf::Low => r.temperature < rule.threshold,
                _ => unreachable!(),
            };
            let key = format!("{}/{}", rule.id, r.channel_id);
            let inst = instances
                .entry(key)
                .or_insert_with(|| AlertInstance::idle(&r.device_id, Some(&r.channel_id)));
            if let Some(state) = inst.step(holds, rule.debounce, now) {
                out.push(notification(rule, &r.device_id, Some(&r.channel_id), state, now));
            }
        }
        out
    }

    /// Évalue les règles disconnect/battery sur un snapshot de connectivité.
    pub fn observe_status(
        &self,
        device_id: &str,
        status: &ConnectivityStatus,
        now: OffsetDateTime,
    ) -> Vec<AlertNotification> {
        let mut out = Vec::new();
        let mut instances = self.instances.lock();
        for rule in self
            .rules
            .iter()
            .filter(|rule| rule.device_id.as_deref() == Some(device_id))
        {
            let holds = match rule.kind {
                AlertKindConf::Disconnect => {
                    matches!(status.connection, ConnectionStatus::Offline | ConnectionStatus::Degraded)
                }
                AlertKindConf::Battery => (status.battery_pct as f64) < rule.threshold,
                _ => continue,
            };
            let inst = instances
                .entry(rule.id.clone())
                .or_insert_with(|| AlertInstance::idle(device_id, None));
            if let Some(state) = inst.step(holds, rule.debounce, now) {
                out.push(notification(rule, device_id, None, state, now));
            }
        }
        out
    }

    /// Alertes actuellement firing (pour le snapshot au subscribe et GET /alerts).
    pub fn firing(&self) -> Vec<AlertNotification> {
        self.firing_for(None)
    }

    /// Variante filtrée par device (snapshot au subscribe).
    pub fn firing_for(&self, device_id: Option<&str>) -> Vec<AlertNotification> {
        let instances = self.instances.lock();
        let mut out = Vec::new();
        for rule in &self.rules {
            for (key, inst) in instances.iter() {
                if inst.state != AlertState::Firing
                    || key != &rule.id && !key.starts_with(&format!("{}/", rule.id))
                {
                    continue;
                }
                if let Some(dev) = device_id {
                    if inst.device_id != dev {
                        continue;
                    }
                }
                out.push(AlertNotification {
                    rule_id: rule.id.clone(),
                    device_id: inst.device_id.clone(),
                    channel_id: inst.channel_id.clone(),
                    rule_kind: rule.kind_str().to_string(),
                    state: "firing".to_string(),
                    timestamp: inst.last_observed_at.map(fmt_rfc3339).unwrap_or_default(),
                });
            }
        }
        out
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }
}

fn notification(
    rule: &AlertRule,
    device_id: &str,
    channel_id: Option<&str>,
    state: AlertState,
    now: OffsetDateTime,
) -> AlertNotification {
    AlertNotification {
        rule_id: rule.id.clone(),
        device_id: device_id.to_string(),
        channel_id: channel_id.map(str::to_string),
        rule_kind: rule.kind_str().to_string(),
        state: match state {
            AlertState::Firing => "firing",
            AlertState::Resolved => "resolved",
            _ => "internal",
        }
        .to_string(),
        timestamp: fmt_rfc3339(now),
    }
}
