use mqtt_to_influx::config::Config;
use mqtt_to_influx::influx::{spawn_writer, InfluxClient};
use mqtt_to_influx::ingest::Ingestor;
use mqtt_to_influx::mqtt::Subscription;
use mqtt_to_influx::point::PointBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(topic = %cfg.mqtt.topic, bucket = %cfg.influx.bucket, "loaded config");

    let client = InfluxClient::new(&cfg.influx)?;
    let (sink, writer) = spawn_writer(client, cfg.influx.write.clone());
    info!(url = %cfg.influx.url, org = %cfg.influx.org, "influx writer started");

    let mut subscription = Subscription::open(&cfg.mqtt)?;
    info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "connecting to broker");

    let ingestor = Ingestor::new(Arc::new(sink), PointBuilder::new(&cfg.influx.measurement));

    let sig = tokio::signal::ctrl_c();
    tokio::pin!(sig);
    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                info!("shutdown requested");
                break;
            }
            res = subscription.next_publish() => {
                match res {
                    Ok(msg) => {
                        let topic = String::from_utf8_lossy(&msg.topic);
                        ingestor.handle_message(&topic, msg.payload.as_ref());
                    }
                    Err(e) => {
                        warn!("mqtt error: {e}; reconnecting after short delay");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    }

    info!("closing connections");
    if let Err(e) = subscription.disconnect(Duration::from_secs(2)).await {
        warn!(error = %e, "mqtt disconnect failed");
    }
    drop(ingestor);
    writer.closed().await;
    info!("shutdown complete");

    Ok(())
}
