use crate::models::Reading;
use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc;
use tokio::task;

/// File du forwarding historique. Le producteur utilise try_send : une file
/// pleine droppe la lecture plutôt que de ralentir le chemin live.
pub fn history_channel(capacity: usize) -> (mpsc::Sender<Reading>, mpsc::Receiver<Reading>) {
    mpsc::channel(capacity.max(1))
}

/// Forward fire-and-forget de chaque lecture vers le store historique (topic
/// MQTT). Un échec de publication est loggé et oublié : il n'affecte jamais
/// le chemin live. Sans broker configuré, la file est simplement drainée.
pub fn spawn_history_forwarder(mut rx: mpsc::Receiver<Reading>, client: Option<AsyncClient>) {
    task::spawn(async move {
        if client.is_none() {
            println!("[history] no MQTT broker configured, readings are not forwarded");
        }
        let mut failures: u64 = 0;
        while let Some(reading) = rx.recv().await {
            let Some(client) = &client else { continue };
            let payload = match serde_json::to_string(&reading) {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("[history] serialize failed: {e}");
                    continue;
                }
            };
            if let Err(e) = client
                .publish(crate::mqtt::TOPIC_HISTORY, QoS::AtMostOnce, false, payload)
                .await
            {
                failures += 1;
                // log dégressif : pas une ligne par lecture quand le broker est down
                if failures == 1 || failures % 100 == 0 {
                    eprintln!("[history] forward failed ({failures} so far): {e:?}");
                }
            }
        }
    });
}
