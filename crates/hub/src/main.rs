mod config;
mod controller;
mod crops;
mod db;
mod history;
mod pump;
mod recommend;
mod scheduler;
mod session;
mod simulator;
mod state;
mod transport;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use db::Db;
use pump::PumpBoard;
use recommend::UserProfile;
use session::{Monitor, Session, SessionOptions, SharedPumps, SystemClock};
use state::{SharedState, SystemState};
use transport::{extract_node_id, parse_line, LinkMessage};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let mqtt_disabled = env_flag("MQTT_DISABLED").unwrap_or(false);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:ecosterile.db".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed crops + profile) ──────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    // The database is the source of truth for the catalog.
    let catalog = db.load_crops().await?;
    if catalog.is_empty() {
        tracing::warn!("no crops in the database; crop selection is unavailable");
    }
    tracing::info!(crops = catalog.len(), user = %cfg.session.user_id, "db ready");

    // ── Pump board ──────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env_flag("RELAY_ACTIVE_LOW").unwrap_or(true);
    let mut board = PumpBoard::new(cfg.pumps.pins(), active_low)?;
    board.all_off();
    let pumps: SharedPumps = Arc::new(Mutex::new(board));

    // ── Shared state (ephemeral, for the JSON API) ──────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── Monitoring session ──────────────────────────────────────────
    let monitor = Monitor::new();
    let session = Session::start(
        SessionOptions {
            user_id: cfg.session.user_id.clone(),
            settings: cfg.controller.settings(),
            reagents: cfg.reagents.clone(),
            catalog: catalog.clone(),
            crop: cfg.session.crop.clone(),
        },
        Some(db.clone()),
        Arc::clone(&pumps),
        Arc::clone(&shared),
        Arc::new(SystemClock),
    )
    .await;
    monitor.begin(session).await;

    // Both transports feed one channel so ingestion stays serialised.
    let (link_tx, link_rx) = mpsc::channel::<LinkMessage>(64);
    tokio::spawn(consume_link(link_rx, monitor.clone()));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        status: Arc::clone(&shared),
        monitor: monitor.clone(),
        catalog: Arc::new(catalog),
        profile: Arc::new(UserProfile {
            farm_location: cfg.session.farm_location.clone(),
        }),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app).await {
            tracing::error!(error = %format!("{e:#}"), "web server stopped");
        }
    });

    // ── Serial link ─────────────────────────────────────────────────
    if let Ok(path) = env::var("SERIAL_PATH") {
        tokio::spawn(run_serial(
            path,
            link_tx.clone(),
            Arc::clone(&shared),
            Arc::clone(&pumps),
        ));
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let link = async {
        if mqtt_disabled {
            tracing::info!("mqtt disabled");
            std::future::pending::<Result<()>>().await
        } else {
            run_mqtt(&broker, port, link_tx, Arc::clone(&shared), Arc::clone(&pumps)).await
        }
    };

    tokio::select! {
        res = link => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    monitor.end().await;
    pumps.lock().await.all_off();
    Ok(())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Apply link messages to whichever session is active.
async fn consume_link(mut rx: mpsc::Receiver<LinkMessage>, monitor: Monitor) {
    while let Some(msg) = rx.recv().await {
        let result = match msg {
            LinkMessage::Ph(value) => monitor.ingest_sensor(value).await.map(|_| ()),
            LinkMessage::Pump(report) => monitor.report_pump(report).await,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "link message dropped");
        }
    }
}

/// Read the serial device line by line, reopening it after EOF or errors.
async fn run_serial(
    path: String,
    tx: mpsc::Sender<LinkMessage>,
    shared: SharedState,
    pumps: SharedPumps,
) {
    loop {
        match transport::open_serial(&path).await {
            Ok(device) => {
                tracing::info!(%path, "serial link open");
                shared
                    .write()
                    .await
                    .record_link(true, format!("serial link open on {path}"));

                match transport::forward_lines(device, tx.clone()).await {
                    Ok(dropped) => tracing::warn!(%path, dropped, "serial link closed"),
                    Err(e) => tracing::error!(%path, error = %format!("{e:#}"), "serial link failed"),
                }
            }
            Err(e) => tracing::error!(error = %format!("{e:#}"), "serial link unavailable"),
        }

        if tx.is_closed() {
            return;
        }

        // Best-effort fail-safe: turn everything off on comms loss
        pumps.lock().await.all_off();
        {
            let mut st = shared.write().await;
            st.link_connected = false;
            st.record_error(format!("serial link lost on {path}"));
        }

        sleep(RECONNECT_DELAY).await;
    }
}

async fn run_mqtt(
    broker: &str,
    port: u16,
    tx: mpsc::Sender<LinkMessage>,
    shared: SharedState,
    pumps: SharedPumps,
) -> Result<()> {
    let mut mqttoptions = MqttOptions::new("ecosterile-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    client.subscribe("tele/+/ph", QoS::AtLeastOnce).await?;
    tracing::info!(%broker, port, "hub subscribed to tele/+/ph");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(node_id) = extract_node_id(&p.topic) else {
                    tracing::debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };

                let payload = String::from_utf8_lossy(&p.payload);
                for line in payload.lines() {
                    match parse_line(line) {
                        Some(msg) => {
                            tracing::debug!(node = node_id, ?msg, "telemetry");
                            if tx.send(msg).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => tracing::debug!(node = node_id, line, "ignoring malformed telemetry"),
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("mqtt connected");
                shared
                    .write()
                    .await
                    .record_link(true, "mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("mqtt disconnected");
                shared
                    .write()
                    .await
                    .record_link(false, "mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "mqtt error, reconnecting");
                // Best-effort fail-safe: turn everything off on comms error
                pumps.lock().await.all_off();

                let mut st = shared.write().await;
                st.link_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
