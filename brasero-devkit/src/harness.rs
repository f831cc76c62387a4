/*!
Test Harness pour intégrations Brasero

Facilite l'écriture de tests autour du bus MQTT avec:
- Setup automatique du mock MQTT
- Envoi d'événements types (registration de device, transitions d'alertes)
- Assertions sur les messages échangés
*/

use crate::builders::BraseroMessageBuilder;
use crate::mqtt_stub::MockMqttClient;
use crate::topics;
use anyhow::Result;

/// Harness de test complet pour intégrations Brasero
pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok(); // init logging pour tests
        Self {
            mqtt_client: MockMqttClient::new(),
        }
    }

    /// Simule l'annonce d'un device réel
    pub async fn send_register(
        &self,
        device_id: &str,
        name: &str,
        channels: &[(&str, &str, &str)],
    ) -> Result<()> {
        let payload = BraseroMessageBuilder::register_v1(device_id, name, channels);
        self.mqtt_client
            .simulate_incoming(topics::REGISTER, serde_json::to_vec(&payload)?)
            .await?;
        log::info!("🔥 Sent register for device: {}", device_id);
        Ok(())
    }

    /// Vérifie qu'exactement `expected` messages sont partis sur un topic
    pub fn assert_published(&self, topic: &str, expected: usize) -> Result<()> {
        let actual = self.mqtt_client.published_on(topic).len();
        if actual != expected {
            anyhow::bail!("topic {topic}: expected {expected} messages, got {actual}");
        }
        Ok(())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
