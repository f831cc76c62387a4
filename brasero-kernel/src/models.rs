use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Unité d'affichage d'une sonde. En interne tout le pipeline travaille en °F,
/// la conversion se fait à la frontière (adapter pour les devices réels, vues pour l'API).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TempUnit {
    #[serde(rename = "F")]
    Fahrenheit,
    #[serde(rename = "C")]
    Celsius,
}

impl TempUnit {
    /// Convertit une valeur exprimée dans cette unité vers des °F.
    pub fn to_fahrenheit(&self, value: f64) -> f64 {
        match self {
            TempUnit::Fahrenheit => value,
            TempUnit::Celsius => value * 9.0 / 5.0 + 32.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Food,
    Ambient,
    Surface,
}

/// Sonde appartenant à un device (1 device -> N channels).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub label: String,
    pub kind: ProbeKind,
    pub unit: TempUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
    Degraded,
}

/// Snapshot connectivité d'un device (batterie/signal/état), avancé sur une
/// horloge plus lente que les lectures de température.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityStatus {
    pub battery_pct: f32,
    pub signal_pct: f32,
    pub connection: ConnectionStatus,
    pub last_seen: OffsetDateTime,
}

/// Lecture de température : l'unité de donnée qui traverse tout le pipeline.
/// Immuable une fois produite; `temperature` est toujours en °F.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub channel_id: String,
    pub ts: OffsetDateTime,
    pub temperature: f64,
    pub unit: TempUnit,
}

// ---------------------------------------------------------------------------
// Messages MQTT entrants (devices réels -> kernel)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeviceRegisterIn {
    pub device_id: String,
    pub name: String,
    pub channels: Vec<ChannelIn>,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelIn {
    pub id: String,
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub kind: ProbeKind,
    pub unit: TempUnit,
}

/// Réponse du endpoint readings d'un device réel (RemoteSource).
#[derive(Debug, Deserialize)]
pub struct RemoteReadingsIn {
    pub readings: Vec<RemoteReadingIn>,
    pub battery_pct: Option<f32>,
    pub signal_pct: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteReadingIn {
    pub channel_id: String,
    pub temperature: f64,
    pub unit: TempUnit,
}

// ---------------------------------------------------------------------------
// Payloads du stream dashboard (vues sérialisées, timestamps RFC3339)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub temperature: Option<f64>,
    pub unit: TempUnit,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub battery: f32,
    pub signal: f32,
    pub connection_status: ConnectionStatus,
}

/// Snapshot complet d'un device, rejoué à chaque (re)subscribe pour qu'un
/// client qui se reconnecte ne reparte jamais de rien.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub timestamp: String,
    pub channels: Vec<ChannelSnapshot>,
    pub status: StatusSnapshot,
    pub firing_alerts: Vec<AlertNotification>,
}

/// Transition d'alerte telle qu'émise vers l'extérieur (stream + MQTT).
/// Seules les transitions firing/resolved sont observables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotification {
    pub rule_id: String,
    pub device_id: String,
    pub channel_id: Option<String>,
    pub rule_kind: String,
    pub state: String,
    pub timestamp: String,
}

pub fn fmt_rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversion_celsius() {
        assert_eq!(TempUnit::Celsius.to_fahrenheit(0.0), 32.0);
        assert_eq!(TempUnit::Celsius.to_fahrenheit(100.0), 212.0);
        assert_eq!(TempUnit::Fahrenheit.to_fahrenheit(225.0), 225.0);
    }

    #[test]
    fn reading_json_roundtrip() {
        let r = Reading {
            device_id: "grill-1".into(),
            channel_id: "probe-1".into(),
            ts: OffsetDateTime::now_utc(),
            temperature: 162.5,
            unit: TempUnit::Fahrenheit,
        };
        let v = serde_json::to_value(&r).unwrap();
        let back: Reading = serde_json::from_value(v).unwrap();
        assert_eq!(back.channel_id, "probe-1");
        assert_eq!(back.temperature, 162.5);
        assert_eq!(back.ts, r.ts);
    }
}
