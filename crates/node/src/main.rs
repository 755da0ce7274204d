mod adc;
#[cfg(feature = "sim")]
mod sim;

#[cfg(not(any(feature = "sim", feature = "adc")))]
compile_error!("enable the `sim` or `adc` feature to give the node a pH source");

use anyhow::{bail, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

/// One line of the hub's sensor link protocol.
#[derive(Debug, Serialize)]
struct PhLine {
    #[serde(rename = "pH")]
    ph: f64,
}

fn encode_line(ph: f64) -> Result<String> {
    let mut line = serde_json::to_string(&PhLine { ph })?;
    line.push('\n');
    Ok(line)
}

// ---------------------------------------------------------------------------
// pH source
// ---------------------------------------------------------------------------

enum Probe {
    #[cfg(feature = "sim")]
    Sim(sim::PhProbeSim),
    #[cfg(feature = "adc")]
    Adc(adc::PhProbe),
}

impl Probe {
    /// The ADC when built with `adc` (unless `PROBE=sim`), else the simulator.
    fn open() -> Result<Self> {
        let want_sim = env::var("PROBE").is_ok_and(|p| p.eq_ignore_ascii_case("sim"));
        if cfg!(feature = "adc") && !want_sim {
            Self::open_adc()
        } else {
            Self::open_sim()
        }
    }

    #[cfg(feature = "adc")]
    fn open_adc() -> Result<Self> {
        Ok(Self::Adc(adc::PhProbe::from_env()?))
    }

    #[cfg(not(feature = "adc"))]
    fn open_adc() -> Result<Self> {
        bail!("built without the `adc` feature")
    }

    #[cfg(feature = "sim")]
    fn open_sim() -> Result<Self> {
        let scenario = sim::Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
        tracing::info!(%scenario, "using simulated ph probe");
        Ok(Self::Sim(sim::PhProbeSim::new(scenario)))
    }

    #[cfg(not(feature = "sim"))]
    fn open_sim() -> Result<Self> {
        bail!("built without the `sim` feature")
    }

    fn sample(&mut self) -> Option<f64> {
        match self {
            #[cfg(feature = "sim")]
            Self::Sim(s) => s.sample(),
            #[cfg(feature = "adc")]
            Self::Adc(p) => p.sample(),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

enum Sink {
    Mqtt { client: AsyncClient, topic: String },
    /// Line-delimited JSON on stdout, for piping into the hub's serial reader.
    Stdout(Stdout),
}

impl Sink {
    async fn send(&mut self, line: String) -> Result<()> {
        match self {
            Self::Mqtt { client, topic } => {
                client
                    .publish(topic.as_str(), QoS::AtLeastOnce, false, line.into_bytes())
                    .await?;
            }
            Self::Stdout(out) => {
                out.write_all(line.as_bytes()).await?;
                out.flush().await?;
            }
        }
        Ok(())
    }
}

fn connect_mqtt(node_id: &str) -> Sink {
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "192.168.1.10".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);

    let mut mqttoptions = MqttOptions::new(format!("ecosterile-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // We only publish, but the eventloop must run to keep the connection alive.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => tracing::info!("node connected to mqtt"),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "mqtt error, retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = format!("tele/{node_id}/ph");
    tracing::info!(%topic, "publishing");
    Sink::Mqtt { client, topic }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout output stays pure protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node-a".to_string());
    let sample_every_ms: u64 = env::var("SAMPLE_EVERY_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2_000);

    let mut probe = Probe::open()?;
    let mut sink = match env::var("OUTPUT").as_deref() {
        Ok("stdout") => Sink::Stdout(tokio::io::stdout()),
        _ => connect_mqtt(&node_id),
    };

    loop {
        match probe.sample() {
            Some(ph) => {
                let line = encode_line(ph)?;
                match sink.send(line).await {
                    Ok(()) => tracing::debug!(node = %node_id, ph, "sample sent"),
                    Err(e) => tracing::error!(error = %e, "send failed"),
                }
            }
            None => tracing::debug!(node = %node_id, "probe silent"),
        }

        sleep(Duration::from_millis(sample_every_ms)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
