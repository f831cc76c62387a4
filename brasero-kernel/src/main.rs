/**
 * BRASERO KERNEL - Point d'entrée principal du moteur télémétrie
 *
 * RÔLE : Orchestration de tous les modules : config, cache, registre devices,
 * simulation, boucles de poll, alertes, stream, MQTT, HTTP.
 *
 * ARCHITECTURE : une task de poll par device -> write-through cache ->
 * {alertes, stream, rollups, historique} -> dashboards WebSocket + bus MQTT.
 * UTILITÉ : Cerveau du dashboard grill : tout l'état "courant" vit ici.
 */

use brasero_kernel::adapter::{spawn_poll_loops, Pipeline, SimulatedSource};
use brasero_kernel::alerts::AlertEvaluator;
use brasero_kernel::cache::CacheHub;
use brasero_kernel::config::{load_config, KernelConfig};
use brasero_kernel::history::{history_channel, spawn_history_forwarder};
use brasero_kernel::http::{build_router, AppState};
use brasero_kernel::mqtt::{create_publisher, spawn_register_listener};
use brasero_kernel::profiles::ProfileLibrary;
use brasero_kernel::registry::{default_devices, DeviceRegistry};
use brasero_kernel::rollup::RollupTracker;
use brasero_kernel::session::SessionManager;
use brasero_kernel::stream::StreamHub;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let mut cfg_loaded: KernelConfig = load_config().await;
    if cfg_loaded.devices.is_empty() {
        println!("[kernel] no devices configured, seeding default simulated smoker");
        cfg_loaded.devices = default_devices();
    }
    let cfg = Arc::new(cfg_loaded);

    // bibliothèque de profils : presets + overrides YAML (erreur = fatale ici,
    // jamais plus tard pendant un advance)
    let profiles = match ProfileLibrary::builtin().with_config(&cfg.profiles) {
        Ok(lib) => Arc::new(lib),
        Err(e) => {
            eprintln!("[kernel] invalid profile config: {e}");
            std::process::exit(1);
        }
    };
    println!("[kernel] {} cooking profiles loaded", profiles.names().len());

    // règles d'alertes : malformée = fatale au boot
    let alerts = match AlertEvaluator::from_config(&cfg.alerts) {
        Ok(eval) => Arc::new(eval),
        Err(e) => {
            eprintln!("[kernel] invalid alert rule: {e}");
            std::process::exit(1);
        }
    };

    // cache étagé + sweeper
    let cache = CacheHub::new(&cfg.cache);
    CacheHub::spawn_sweeper(Arc::clone(&cache));

    // registre devices (config + enregistrements MQTT)
    let registry = Arc::new(DeviceRegistry::from_config(&cfg.devices, Arc::clone(&cache)));

    // sessions + source simulée
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&profiles),
        cfg.sim.clone(),
        cfg.events.clone(),
    ));
    let simulated = SimulatedSource::new(Arc::clone(&sessions), Arc::clone(&cfg));

    // stream hub + rollups
    let stream = StreamHub::new(Arc::clone(&cache), cfg.stream.buffer);
    let rollups = RollupTracker::new(cfg.cache.rollups_ttl_secs.clamp(30, 300));
    RollupTracker::spawn_ticker(Arc::clone(&rollups), Arc::clone(&cache));

    // bus MQTT sortant (alertes + historique) et listener d'enregistrement
    let mqtt_client = cfg.mqtt.as_ref().map(create_publisher);
    if let Some(mqtt_cfg) = cfg.mqtt.clone() {
        spawn_register_listener(mqtt_cfg, Arc::clone(&registry));
    } else {
        println!("[kernel] no MQTT broker configured, running HTTP-only");
    }

    // forwarding historique fire-and-forget
    let (history_tx, history_rx) = history_channel(cfg.history.queue);
    spawn_history_forwarder(history_rx, mqtt_client.clone());

    // pipeline + boucles de poll par device
    let pipeline = Pipeline::new(
        Arc::clone(&cache),
        Arc::clone(&registry),
        Arc::clone(&alerts),
        Arc::clone(&stream),
        Arc::clone(&rollups),
        history_tx,
        mqtt_client,
        cfg.sim.signal_threshold_pct,
    );
    spawn_poll_loops(&cfg, &pipeline, &simulated);

    // HTTP
    let app_state = AppState {
        cfg: Arc::clone(&cfg),
        cache,
        registry,
        sessions,
        alerts,
        stream,
        profiles,
        started_at: Instant::now(),
    };
    let app = build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    println!("[kernel] listening on http://{addr}");
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("[kernel] cannot bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("[kernel] server error: {e}");
        std::process::exit(1);
    }
}
