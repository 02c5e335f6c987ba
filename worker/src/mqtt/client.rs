//! MQTT-backed publish channel

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::WorkerError;
use crate::publish::channel::PublishChannel;

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
        }
    }
}

/// Default packet size limit; rumqttc's own default is 10 KiB
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Connection tuning for [`MqttChannel`]
#[derive(Debug, Clone)]
pub struct MqttChannelOptions {
    /// Request queue capacity between publishers and the event loop
    pub capacity: usize,

    /// Delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// Consecutive connection errors before the event loop gives up
    pub max_connection_errors: u32,

    /// Upper bound on waiting for acknowledgements in `close`
    pub flush_timeout: Duration,

    /// Largest packet sent or accepted, in bytes
    pub max_packet_size: usize,
}

impl Default for MqttChannelOptions {
    fn default() -> Self {
        Self {
            capacity: 256,
            reconnect_delay: Duration::from_secs(1),
            max_connection_errors: 10,
            flush_timeout: Duration::from_secs(10),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// Publishes awaiting a PUBACK
#[derive(Debug, Default)]
struct Inflight {
    pending: AtomicUsize,
    stopped: AtomicBool,
    notify: Notify,
}

impl Inflight {
    fn add(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn ack(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.notify.notify_waiters();
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_drained(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 || self.stopped.load(Ordering::SeqCst)
    }
}

/// MQTT channel
///
/// Channel keys are used verbatim as topics. Publishes use QoS 1 so `close`
/// can wait for the broker to acknowledge everything before disconnecting.
pub struct MqttChannel {
    client: AsyncClient,
    inflight: Arc<Inflight>,
    driver: Mutex<Option<JoinHandle<()>>>,
    flush_timeout: Duration,
    max_packet_size: usize,
}

impl MqttChannel {
    /// Create the client and start driving its event loop
    pub fn connect(
        address: &MqttAddress,
        client_id: &str,
        options: &MqttChannelOptions,
    ) -> Result<Self, WorkerError> {
        if address.host.is_empty() {
            return Err(WorkerError::MqttError("MQTT host is not configured".to_string()));
        }

        let mut mqtt_options = MqttOptions::new(client_id, &address.host, address.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_max_packet_size(options.max_packet_size, options.max_packet_size);
        if let Some(ref username) = address.username {
            let password = address
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string())
                .unwrap_or_default();
            mqtt_options.set_credentials(username, password);
        }

        if address.use_tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = address.ca_cert_path {
                let ca_pem = std::fs::read(ca_path).map_err(|e| {
                    WorkerError::MqttError(format!("Failed to read CA cert {ca_path}: {e}"))
                })?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            mqtt_options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.capacity);
        let inflight = Arc::new(Inflight::default());
        let driver = tokio::spawn(drive(
            eventloop,
            inflight.clone(),
            options.reconnect_delay,
            options.max_connection_errors,
        ));

        info!(
            host = %address.host,
            port = address.port,
            client_id = %client_id,
            "MQTT channel created"
        );

        Ok(Self {
            client,
            inflight,
            driver: Mutex::new(Some(driver)),
            flush_timeout: options.flush_timeout,
            max_packet_size: options.max_packet_size,
        })
    }

    async fn wait_for_acks(&self) {
        let deadline = tokio::time::Instant::now() + self.flush_timeout;
        loop {
            let notified = self.inflight.notify.notified();
            if self.inflight.is_drained() {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    pending = self.inflight.pending.load(Ordering::SeqCst),
                    "Timed out waiting for MQTT acknowledgements"
                );
                return;
            }
        }
    }
}

#[async_trait]
impl PublishChannel for MqttChannel {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), WorkerError> {
        // The event loop drops oversized packets and tears down the connection.
        let size = publish_packet_size(key, payload.len());
        if size > self.max_packet_size {
            return Err(WorkerError::PublishError {
                key: key.to_string(),
                message: format!(
                    "packet of {} bytes exceeds the {} byte limit",
                    size, self.max_packet_size
                ),
            });
        }

        // Counted before queueing so a fast PUBACK cannot be missed.
        self.inflight.add();
        if let Err(e) = self
            .client
            .publish(key, QoS::AtLeastOnce, false, payload)
            .await
        {
            self.inflight.ack();
            return Err(WorkerError::PublishError {
                key: key.to_string(),
                message: e.to_string(),
            });
        }
        debug!("Queued publish to: {}", key);
        Ok(())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(driver) = driver else {
            return Ok(());
        };

        self.wait_for_acks().await;

        if let Err(e) = self.client.disconnect().await {
            // The event loop already stopped; nothing left to flush.
            debug!("MQTT disconnect request not delivered: {}", e);
        }
        match tokio::time::timeout(self.flush_timeout, driver).await {
            Ok(Ok(())) => {
                info!("MQTT disconnected");
                Ok(())
            }
            Ok(Err(e)) => Err(WorkerError::Internal(format!("MQTT event loop panicked: {e}"))),
            Err(_) => Err(WorkerError::MqttError(
                "Timed out waiting for MQTT disconnect".to_string(),
            )),
        }
    }
}

/// Upper bound of the encoded size of a QoS 1 PUBLISH packet
fn publish_packet_size(topic: &str, payload_len: usize) -> usize {
    // Fixed header (1 + up to 4 length bytes), topic length, packet id.
    let variable = 2 + topic.len() + 2 + payload_len;
    1 + 4 + variable
}

async fn drive(
    mut eventloop: EventLoop,
    inflight: Arc<Inflight>,
    reconnect_delay: Duration,
    max_connection_errors: u32,
) {
    let mut errors = 0;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                errors = 0;
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => inflight.ack(),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                errors += 1;
                if errors >= max_connection_errors {
                    error!("MQTT connection failed {} times, giving up: {}", errors, e);
                    break;
                }
                warn!("MQTT poll error: {}, reconnecting...", e);
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
    inflight.stop();
}
