use crate::point::DEFAULT_MEASUREMENT;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub influx: InfluxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Prefix for the client id; a random suffix is appended per connection.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub clean_session: Option<bool>,
    /// Topic filter carrying sensor readings; wildcards allowed.
    #[serde(default)]
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    pub tls: Option<TlsConfig>,
}

fn default_mqtt_host() -> String {
    "localhost".into()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "mqtt-to-influx".into()
}

fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to a PEM CA bundle (optional)
    pub ca_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxConfig {
    #[serde(default)]
    pub url: String,
    pub token: Option<String>,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
    /// Series name written for every reading
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default)]
    pub write: WriteConfig,
}

fn default_measurement() -> String {
    DEFAULT_MEASUREMENT.into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Points queued beyond this are refused instead of blocking ingestion.
    pub max_buffer_points: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_buffer_points: 32_000,
        }
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards MQTT_URL, MQTT_TOPIC and INFLUX_* env vars override the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;
        cfg.apply_env_overrides()?;
        cfg.check()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), anyhow::Error> {
        if let Ok(url) = std::env::var("MQTT_URL") {
            let (host, port) = crate::mqtt::parse_broker_url(&url)?;
            self.mqtt.host = host.to_string();
            self.mqtt.port = port;
        }
        if let Ok(topic) = std::env::var("MQTT_TOPIC") {
            self.mqtt.topic = topic;
        }
        if let Ok(url) = std::env::var("INFLUX_URL") {
            self.influx.url = url;
        }
        if let Ok(token) = std::env::var("INFLUX_TOKEN") {
            self.influx.token = Some(token);
        }
        if let Ok(org) = std::env::var("INFLUX_ORG") {
            self.influx.org = org;
        }
        if let Ok(bucket) = std::env::var("INFLUX_BUCKET") {
            self.influx.bucket = bucket;
        }
        Ok(())
    }

    fn check(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(!self.mqtt.topic.is_empty(), "mqtt.topic must be set");
        anyhow::ensure!(self.mqtt.qos <= 2, "mqtt.qos must be 0, 1 or 2");
        anyhow::ensure!(!self.influx.url.is_empty(), "influx.url must be set");
        anyhow::ensure!(!self.influx.org.is_empty(), "influx.org must be set");
        anyhow::ensure!(!self.influx.bucket.is_empty(), "influx.bucket must be set");
        anyhow::ensure!(
            !self.influx.measurement.is_empty(),
            "influx.measurement must not be empty"
        );
        anyhow::ensure!(
            self.influx.write.batch_size > 0,
            "influx.write.batch_size must be greater than zero"
        );
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$"; any other '$' is kept as-is.
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close)
            .with_context(|| format!("unterminated env placeholder: missing '{close}'"))?;
        let val = std::env::var(&var)
            .with_context(|| format!("missing environment variable: {}", var))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Read characters until we hit `end`, returning the collected string.
/// Consumes the closing delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
