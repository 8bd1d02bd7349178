use crate::config::MqttConfig;
use crate::error::AppError;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Event, Incoming};
use rumqttc::{Outgoing, Transport};

type MqttOptions = rumqttc::v5::MqttOptions;
type AsyncClient = rumqttc::v5::AsyncClient;
type EventLoop = rumqttc::v5::EventLoop;
pub type V5Publish = rumqttc::v5::mqttbytes::v5::Publish;

fn build_options(cfg: &MqttConfig) -> Result<MqttOptions, AppError> {
    if cfg.host.is_empty() {
        return Err(AppError::Config("mqtt.host must be set".into()));
    }
    let client_id = format!("{}-{}", cfg.client_id, Uuid::new_v4());
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_start(cfg.clean_session.unwrap_or(true));
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if let Some(tls) = &cfg.tls {
        let ca = std::fs::read(&tls.ca_file)
            .map_err(|e| AppError::Config(format!("reading CA file {}: {e}", tls.ca_file)))?;
        opts.set_transport(Transport::tls(ca, None, None));
    } else if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    Ok(opts)
}

pub fn qos(level: u8) -> Result<QoS, AppError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        n => Err(AppError::Config(format!("unsupported mqtt qos {n}"))),
    }
}

/// One broker connection bound to the readings topic.
///
/// The subscription is (re)issued on every ConnAck: with a clean start the
/// broker forgets it whenever the connection drops.
pub struct Subscription {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    qos: QoS,
}

impl Subscription {
    pub fn open(cfg: &MqttConfig) -> Result<Self, AppError> {
        let options = build_options(cfg)?;
        let (client, eventloop) = AsyncClient::new(options, 50);
        Ok(Self {
            client,
            eventloop,
            topic: cfg.topic.clone(),
            qos: qos(cfg.qos)?,
        })
    }

    pub async fn next_publish(&mut self) -> Result<V5Publish, AppError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(p))) => return Ok(p),
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    self.client
                        .try_subscribe(self.topic.clone(), self.qos)
                        .map_err(|e| AppError::Mqtt(format!("subscribe {}: {e}", self.topic)))?;
                    info!(topic = %self.topic, "connected; subscribing");
                }
                Ok(Event::Incoming(Incoming::SubAck(_))) => {
                    debug!(topic = %self.topic, "subscription acknowledged");
                }
                Ok(_) => continue,
                Err(e) => return Err(AppError::Mqtt(e.to_string())),
            }
        }
    }

    /// Queue a DISCONNECT and keep polling until it has been written, the
    /// connection fails, or `grace` runs out.
    pub async fn disconnect(mut self, grace: Duration) -> Result<(), AppError> {
        self.client
            .try_disconnect()
            .map_err(|e| AppError::Mqtt(e.to_string()))?;
        let eventloop = &mut self.eventloop;
        let sent = tokio::time::timeout(grace, async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => return Err(AppError::Mqtt(e.to_string())),
                }
            }
        })
        .await;
        sent.unwrap_or_else(|_| Err(AppError::Mqtt(format!("disconnect not sent within {grace:?}"))))
    }
}

/// Split `mqtt://host:port`, `tcp://host:port` or `host[:port]`; port defaults to 1883.
pub fn parse_broker_url(url: &str) -> Result<(&str, u16), AppError> {
    let rest = url
        .trim_start_matches("mqtt://")
        .trim_start_matches("tcp://")
        .trim_end_matches('/');

    match rest.split_once(':') {
        None if !rest.is_empty() => Ok((rest, 1883)),
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| AppError::Config(format!("invalid port in broker URL: {port}")))?;
            Ok((host, port))
        }
        _ => Err(AppError::Config(format!("invalid broker URL: {url}"))),
    }
}
