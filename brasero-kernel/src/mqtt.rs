use crate::config::MqttConf;
use crate::models::DeviceRegisterIn;
use crate::registry::DeviceRegistry;
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

/// Topics versionnés du bus Brasero.
pub const TOPIC_REGISTER: &str = "brasero/devices/register@v1";
pub const TOPIC_ALERTS: &str = "brasero/alerts/transition@v1";
pub const TOPIC_HISTORY: &str = "brasero/history/reading@v1";

/// Client de publication partagé (alertes + historique). L'eventloop est
/// drivée par une task dédiée; une erreur MQTT se paie d'un backoff, jamais
/// d'un crash du kernel.
pub fn create_publisher(cfg: &MqttConf) -> AsyncClient {
    let mut opts = MqttOptions::new("brasero-kernel", &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    eprintln!("[mqtt] erreur: {e:?}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
    client
}

/// Écoute les annonces de devices réels et alimente le registre.
pub fn spawn_register_listener(cfg: MqttConf, registry: Arc<DeviceRegistry>) {
    task::spawn(async move {
        let mut opts = MqttOptions::new("brasero-kernel-registry", &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        if let Err(e) = client.subscribe(TOPIC_REGISTER, QoS::AtLeastOnce).await {
            eprintln!("[mqtt] subscribe failed: {e:?}");
            return;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(rumqttc::Incoming::Publish(p)))
                    if p.topic == TOPIC_REGISTER =>
                {
                    if let Ok(txt) = String::from_utf8(p.payload.to_vec()) {
                        match serde_json::from_str::<DeviceRegisterIn>(&txt) {
                            Ok(msg) => registry.handle_register(msg).await,
                            Err(_) => eprintln!("[mqtt] register JSON invalide: {txt}"),
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("[mqtt] erreur: {e:?}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}
