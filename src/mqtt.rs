use anyhow::{Context, Result};
use rumqttc::{Client, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_mqtt_root")]
    mqtt_root: String,
    #[serde(default = "MqttConfig::default_rack_name")]
    rack_name: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(default = "MqttConfig::default_home_assistant_prefix")]
    home_assistant_prefix: String,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_mqtt_root() -> String {
        "PylonToMQTT/".into()
    }

    fn default_rack_name() -> String {
        "Main".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("pylonbms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_home_assistant_prefix() -> String {
        "homeassistant".into()
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let mut config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        // topics are built by plain concatenation, so the root must end
        // with the separator
        if !config.mqtt_root.ends_with('/') {
            config.mqtt_root.push('/');
        }
        Ok(config)
    }

    fn qos_level(&self) -> QoS {
        match self.qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    /// `<root><rack>/stat/<sub>`, e.g. `PylonToMQTT/Main/stat/readings/Pack1`
    pub fn stat_topic(&self, sub: &str) -> String {
        format!("{}{}/stat/{}", self.mqtt_root, self.rack_name, sub)
    }

    /// Availability topic carrying `Online`/`Offline`.
    pub fn lwt_topic(&self) -> String {
        format!("{}{}/tele/LWT", self.mqtt_root, self.rack_name)
    }

    /// Home-Assistant discovery config topic for one sensor.
    pub fn discovery_topic(&self, object_id: &str) -> String {
        format!(
            "{}/sensor/{}/config",
            self.home_assistant_prefix, object_id
        )
    }

    /// Device the pack sensors hang off in discovery documents: the topic
    /// root without its trailing separator.
    pub fn via_device(&self) -> &str {
        self.mqtt_root.trim_end_matches('/')
    }
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive_interval);
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            config.lwt_topic(),
            "Offline",
            config.qos_level(),
            false,
        ));

        log::info!(
            "Connecting to MQTT broker {}:{} with client_id {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, mut connection) = Client::new(options, 16);

        // rumqttc reconnects by itself as long as the event loop is drained
        std::thread::Builder::new()
            .name("mqtt-eventloop".into())
            .spawn(move || {
                for event in connection.iter() {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            log::info!("Connected to MQTT broker")
                        }
                        Ok(event) => log::trace!("MQTT event: {event:?}"),
                        Err(err) => {
                            log::error!("MQTT connection error: {err}");
                            std::thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
            })
            .context("Cannot spawn MQTT event loop thread")?;

        let mut publisher = Self { client, config };
        let lwt_topic = publisher.config.lwt_topic();
        publisher.publish(&lwt_topic, "Online", false)?;
        Ok(publisher)
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{topic}', Payload='{payload}', QoS={}",
            self.config.qos
        );

        self.client
            .publish(topic, self.config.qos_level(), retain, payload)
            .with_context(|| format!("Failed to publish message to MQTT topic: {topic}"))?;

        Ok(())
    }
}
