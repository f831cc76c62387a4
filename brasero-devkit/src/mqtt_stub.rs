/*!
Client MQTT simulé pour développement sans broker

Double de test de rumqttc::AsyncClient : mêmes signatures publish/subscribe,
mais tout reste en mémoire. Les publications sont journalisées pour les
assertions, et un canal permet d'injecter du trafic entrant comme si un
device réel parlait sur le bus Brasero.
*/

use anyhow::Result;
use rumqttc::QoS;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl RecordedMessage {
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn parse<T: for<'de> serde::Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Default)]
struct Journal {
    published: Vec<RecordedMessage>,
    subscriptions: Vec<String>,
    incoming_tx: Option<mpsc::UnboundedSender<RecordedMessage>>,
}

/// Client MQTT en mémoire, clonable comme l'AsyncClient qu'il remplace.
#[derive(Clone, Default)]
pub struct MockMqttClient {
    journal: Arc<Mutex<Journal>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Branche le canal de trafic entrant (côté "kernel sous test").
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<RecordedMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.journal.lock().unwrap().incoming_tx = Some(tx);
        rx
    }

    /// Même signature que rumqttc::AsyncClient::publish.
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let msg = RecordedMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };
        log::info!("📤 [MOCK] publish {} ({} bytes)", msg.topic, msg.payload.len());
        self.journal.lock().unwrap().published.push(msg);
        Ok(())
    }

    /// Même signature que rumqttc::AsyncClient::subscribe.
    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        log::info!("📥 [MOCK] subscribe {topic}");
        self.journal.lock().unwrap().subscriptions.push(topic);
        Ok(())
    }

    /// Injecte un message comme s'il arrivait du broker.
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let msg = RecordedMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        log::info!("📨 [MOCK] incoming {}", msg.topic);
        let tx = self.journal.lock().unwrap().incoming_tx.clone();
        match tx {
            Some(tx) => tx.send(msg).map_err(|e| anyhow::anyhow!("receiver closed: {e}")),
            None => anyhow::bail!("no receiver attached, call setup_receiver() first"),
        }
    }

    /// Journal complet des publications, dans l'ordre d'émission.
    pub fn published(&self) -> Vec<RecordedMessage> {
        self.journal.lock().unwrap().published.clone()
    }

    /// Publications sur un topic précis.
    pub fn published_on(&self, topic: &str) -> Vec<RecordedMessage> {
        self.journal
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Dernier message d'un topic, déjà désérialisé.
    pub fn last_on<T: for<'de> serde::Deserialize<'de>>(&self, topic: &str) -> Result<Option<T>> {
        match self.published_on(topic).last() {
            Some(msg) => Ok(Some(msg.parse()?)),
            None => Ok(None),
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.journal.lock().unwrap().subscriptions.clone()
    }

    /// Remet le journal à zéro entre deux scénarios.
    pub fn clear(&self) {
        let mut journal = self.journal.lock().unwrap();
        journal.published.clear();
        journal.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics;

    #[tokio::test]
    async fn journal_records_publishes_in_order() {
        let client = MockMqttClient::new();
        client
            .publish(topics::ALERTS, QoS::AtLeastOnce, false, br#"{"state":"firing"}"#.to_vec())
            .await
            .unwrap();
        client
            .publish(topics::HISTORY, QoS::AtMostOnce, false, br#"{"temperature":150.0}"#.to_vec())
            .await
            .unwrap();
        client
            .publish(topics::ALERTS, QoS::AtLeastOnce, false, br#"{"state":"resolved"}"#.to_vec())
            .await
            .unwrap();

        assert_eq!(client.published().len(), 3);
        let alerts = client.published_on(topics::ALERTS);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].json().unwrap()["state"], "firing");
        let last: serde_json::Value = client.last_on(topics::ALERTS).unwrap().unwrap();
        assert_eq!(last["state"], "resolved");

        client.clear();
        assert!(client.published().is_empty());
    }

    #[tokio::test]
    async fn incoming_requires_and_reaches_receiver() {
        let client = MockMqttClient::new();
        // sans receiver branché : erreur explicite
        assert!(client
            .simulate_incoming(topics::REGISTER, b"{}".to_vec())
            .await
            .is_err());

        let mut rx = client.setup_receiver();
        client
            .simulate_incoming(topics::REGISTER, br#"{"device_id":"grill-9"}"#.to_vec())
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, topics::REGISTER);
        assert_eq!(msg.json().unwrap()["device_id"], "grill-9");
    }
}
