/*!
Builders de payloads versionnés Brasero

Produisent des JSON conformes aux contrats des topics brasero/...@v1 et de
l'API readings des devices réels. Utilisés par les tests du kernel (round-trip
sur les types de modèles) et par les développeurs de simulateurs de devices.
*/

use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub struct BraseroMessageBuilder;

impl BraseroMessageBuilder {
    /// Annonce d'un device réel sur brasero/devices/register@v1.
    /// `channels` : (id, type de sonde, unité) - types: food/ambient/surface,
    /// unités: "F"/"C".
    pub fn register_v1(device_id: &str, name: &str, channels: &[(&str, &str, &str)]) -> Value {
        json!({
            "device_id": device_id,
            "name": name,
            "channels": channels
                .iter()
                .map(|(id, kind, unit)| json!({
                    "id": id,
                    "label": id,
                    "type": kind,
                    "unit": unit,
                }))
                .collect::<Vec<_>>(),
            "timestamp": now_rfc3339(),
        })
    }

    /// Transition d'alerte telle que publiée sur brasero/alerts/transition@v1.
    pub fn alert_transition_v1(
        device_id: &str,
        channel_id: Option<&str>,
        rule_id: &str,
        rule_kind: &str,
        state: &str,
    ) -> Value {
        json!({
            "rule_id": rule_id,
            "device_id": device_id,
            "channel_id": channel_id,
            "rule_kind": rule_kind,
            "state": state,
            "timestamp": now_rfc3339(),
        })
    }

    /// Réponse du endpoint GET /devices/{id}/readings d'un device réel.
    pub fn remote_readings(
        readings: &[(&str, f64, &str)],
        battery_pct: Option<f32>,
        signal_pct: Option<f32>,
    ) -> Value {
        json!({
            "readings": readings
                .iter()
                .map(|(channel_id, temperature, unit)| json!({
                    "channel_id": channel_id,
                    "temperature": temperature,
                    "unit": unit,
                }))
                .collect::<Vec<_>>(),
            "battery_pct": battery_pct,
            "signal_pct": signal_pct,
        })
    }

    /// Ack client sur le stream WebSocket.
    pub fn stream_ack(seq: u64) -> Value {
        json!({ "ack": seq })
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_payload_shape() {
        let payload = BraseroMessageBuilder::register_v1(
            "grill-9",
            "Kamado",
            &[("probe-1", "food", "C"), ("pit", "ambient", "F")],
        );
        assert_eq!(payload["device_id"], "grill-9");
        assert_eq!(payload["channels"].as_array().unwrap().len(), 2);
        assert_eq!(payload["channels"][0]["type"], "food");
        assert!(payload["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn remote_readings_shape() {
        let payload =
            BraseroMessageBuilder::remote_readings(&[("probe-1", 71.5, "C")], Some(82.0), None);
        assert_eq!(payload["readings"][0]["temperature"], 71.5);
        assert_eq!(payload["battery_pct"], 82.0);
        assert!(payload["signal_pct"].is_null());
    }

    #[test]
    fn alert_transition_shape() {
        let payload = BraseroMessageBuilder::alert_transition_v1(
            "grill-1",
            Some("probe-1"),
            "probe-high",
            "high",
            "firing",
        );
        assert_eq!(payload["state"], "firing");
        assert_eq!(payload["channel_id"], "probe-1");
    }
}
