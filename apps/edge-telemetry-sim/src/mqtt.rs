use crate::config::Config;
use crate::error::TransportError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Per-device topic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub telemetry: String,
    pub analysis: String,
    pub metrics: String,
    pub summary: String,
}

impl Topics {
    pub fn new(prefix: &str, device_id: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            telemetry: format!("{prefix}/telemetry/{device_id}"),
            analysis: format!("{prefix}/analysis/{device_id}"),
            metrics: format!("{prefix}/metrics/{device_id}"),
            summary: format!("{prefix}/metrics/{device_id}/summary"),
        }
    }
}

/// Broker connection used by the publish loop. Publishes are QoS 1 and never retained.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
    async fn disconnect(&mut self);
}

pub async fn publish_json<T, P>(transport: &mut T, topic: &str, payload: &P) -> Result<(), TransportError>
where
    T: Transport + ?Sized,
    P: Serialize + Sync,
{
    let encoded = serde_json::to_vec(payload).map_err(|source| TransportError::Encode {
        topic: topic.to_string(),
        source,
    })?;
    transport.publish(topic, encoded).await
}

#[derive(Debug, Clone, PartialEq)]
enum LinkState {
    Pending,
    Up,
    Down(String),
}

struct Link {
    client: AsyncClient,
    state: watch::Receiver<LinkState>,
    poller: JoinHandle<()>,
}

pub struct MqttTransport {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    client_id: String,
    keep_alive: Duration,
    link: Option<Link>,
}

impl MqttTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            client_id: config.mqtt_client_id.clone(),
            keep_alive: config.mqtt_keepalive,
            link: None,
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }

    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.poller.abort();
        }
    }
}

fn spawn_poller(
    mut eventloop: rumqttc::EventLoop,
    state: watch::Sender<LinkState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        let _ = state.send(LinkState::Up);
                    } else {
                        let _ = state.send(LinkState::Down(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                        return;
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    let _ = state.send(LinkState::Down("broker closed the session".to_string()));
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    let _ = state.send(LinkState::Down(err.to_string()));
                    return;
                }
            }
        }
    })
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.drop_link();

        let (client, eventloop) = AsyncClient::new(self.mqtt_options(), 256);
        let (state_tx, mut state_rx) = watch::channel(LinkState::Pending);
        let poller = spawn_poller(eventloop, state_tx);

        let settled = {
            let waited = tokio::time::timeout(
                CONNECT_TIMEOUT,
                state_rx.wait_for(|state| *state != LinkState::Pending),
            )
            .await;
            match waited {
                Ok(Ok(state)) => Some(state.clone()),
                Ok(Err(_)) => Some(LinkState::Down("event loop stopped".to_string())),
                Err(_) => None,
            }
        };
        let Some(outcome) = settled else {
            poller.abort();
            return Err(TransportError::ConnectTimeout {
                host: self.host.clone(),
                port: self.port,
                timeout: CONNECT_TIMEOUT,
            });
        };

        match outcome {
            LinkState::Up => {
                tracing::info!(host = %self.host, port = self.port, "MQTT connected");
                self.link = Some(Link {
                    client,
                    state: state_rx,
                    poller,
                });
                Ok(())
            }
            LinkState::Down(reason) => {
                poller.abort();
                Err(TransportError::ConnectionLost(reason))
            }
            LinkState::Pending => {
                poller.abort();
                Err(TransportError::NotConnected)
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let current = match self.link.as_ref() {
            Some(link) => link.state.borrow().clone(),
            None => return Err(TransportError::NotConnected),
        };
        if let LinkState::Down(reason) = current {
            self.drop_link();
            return Err(TransportError::ConnectionLost(reason));
        }
        let Some(link) = self.link.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        link.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| TransportError::Publish {
                topic: topic.to_string(),
                message: err.to_string(),
            })
    }

    async fn disconnect(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        if let Err(err) = link.client.disconnect().await {
            tracing::debug!(error=%err, "MQTT disconnect request failed");
        }
        // Let the event loop flush queued publishes and the DISCONNECT packet.
        if tokio::time::timeout(DISCONNECT_GRACE, &mut link.poller)
            .await
            .is_err()
        {
            link.poller.abort();
        }
        tracing::info!("MQTT disconnected");
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.drop_link();
    }
}
