use crate::config::MqttConfig;
use crate::services::workers::WorkerPool;
use log::{debug, error, info, warn};
use rumqttc::{Client, ConnectionError, Event, MqttOptions, Packet, QoS, Transport};
use std::thread;

// Outstanding requests between the client handle and the event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 16;

fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(cfg.keep_alive).set_clean_session(true);
    if let Some(username) = &cfg.username {
        options.set_credentials(username.clone(), cfg.password.clone().unwrap_or_default());
    }
    if cfg.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// What the event loop should do after a notification has been handled.
#[derive(Debug, PartialEq)]
enum Flow {
    Continue,
    /// The connection dropped; wait before the client reconnects.
    Backoff,
}

/// Per-connection state carried across event-loop notifications.
struct Session<'a> {
    cfg: &'a MqttConfig,
    topic: String,
    connected_once: bool,
}

impl<'a> Session<'a> {
    fn new(cfg: &'a MqttConfig, topic: String) -> Self {
        Session {
            cfg,
            topic,
            connected_once: false,
        }
    }

    /// Route one notification. Errors before the first CONNACK are fatal.
    fn on_notification<F>(
        &mut self,
        notification: Result<Event, ConnectionError>,
        pool: &WorkerPool,
        mut subscribe: F,
    ) -> Result<Flow, String>
    where
        F: FnMut(&str) -> Result<(), String>,
    {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                self.connected_once = true;
                info!("MQTT connected to {}:{}", self.cfg.host, self.cfg.port);
                // Clean sessions drop subscriptions, so subscribe on every connect.
                if let Err(e) = subscribe(&self.topic) {
                    error!("MQTT subscribe to {} failed: {}", self.topic, e);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                info!("Subscribed to topic: {}", self.topic);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Message on {} ({} bytes)", publish.topic, publish.payload.len());
                pool.submit(publish.payload.to_vec())?;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("MQTT broker sent disconnect");
            }
            Ok(_) => {}
            Err(e) if !self.connected_once => {
                return Err(format!(
                    "MQTT connection to {}:{} failed: {}",
                    self.cfg.host, self.cfg.port, e
                ));
            }
            Err(e) => {
                error!(
                    "MQTT error: {}; reconnecting in {}s",
                    e,
                    self.cfg.reconnect_delay.as_secs()
                );
                return Ok(Flow::Backoff);
            }
        }
        Ok(Flow::Continue)
    }
}

/// Consume the telemetry topic until the connection is closed for good.
///
/// The first connection attempt must succeed; afterwards errors are logged and
/// the client reconnects after `reconnect_delay`. Messages published while
/// disconnected are not replayed.
pub fn run(cfg: &MqttConfig, pool: &WorkerPool) -> Result<(), String> {
    let topic = cfg
        .topic
        .clone()
        .ok_or_else(|| "MQTT_TOPIC must be set to consume from the broker".to_string())?;
    info!(
        "MQTT config: host={}, port={}, client_id={}, username={}, topic={}, tls={}",
        cfg.host,
        cfg.port,
        cfg.client_id,
        cfg.username.as_deref().unwrap_or("-"),
        topic,
        cfg.tls
    );

    let (client, mut connection) = Client::new(mqtt_options(cfg), REQUEST_CHANNEL_CAPACITY);
    let mut session = Session::new(cfg, topic);

    for notification in connection.iter() {
        let flow = session.on_notification(notification, pool, |topic| {
            client
                .try_subscribe(topic, QoS::AtLeastOnce)
                .map_err(|e| e.to_string())
        })?;
        if flow == Flow::Backoff {
            thread::sleep(cfg.reconnect_delay);
        }
    }

    warn!("MQTT event loop ended");
    Ok(())
}
