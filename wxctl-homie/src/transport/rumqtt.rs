use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, LastWill as Will, MqttOptions,
    Outgoing, Packet, QoS, Transport,
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::Duration,
};

use super::{InboundMessage, MqttTransport, SessionEvent, SessionOptions, TransportError};

// Requests buffered between the client handle and the event loop driver
const REQUEST_CAPACITY: usize = 256;

// Pause between polls while the library is reconnecting
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// [`MqttTransport`] over `rumqttc`. Once connected, a driver task polls the
/// event loop so requests flow and inbound messages are forwarded; requests
/// themselves are only issued by the caller through the client handle.
#[derive(Default)]
pub struct RumqttTransport {
    client: Option<AsyncClient>,
    events: Option<UnboundedReceiver<SessionEvent>>,
    driver: Option<JoinHandle<()>>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn mqtt_options(options: &SessionOptions) -> Result<MqttOptions, TransportError> {
        let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_last_will(Will::new(
            &options.will.topic,
            options.will.payload.clone(),
            QoS::AtLeastOnce,
            options.will.retain,
        ));
        if let Some(tls) = &options.tls {
            log::debug!("building TLS configuration");
            let transport = match (&tls.ca, &tls.client_auth) {
                (Some(ca), client_auth) => Transport::tls(ca.clone(), client_auth.clone(), None),
                (None, None) => Transport::tls_with_default_config(),
                (None, Some(_)) => {
                    return Err(TransportError::Tls(
                        "client authentication needs a CA certificate".to_string(),
                    ))
                }
            };
            mqtt.set_transport(transport);
        }
        Ok(mqtt)
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotConnected)
    }

    async fn drive(mut eventloop: EventLoop, events: UnboundedSender<SessionEvent>) {
        let mut connected = true;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = InboundMessage {
                        topic: publish.topic.clone(),
                        payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                    };
                    if events.send(SessionEvent::Message(msg)).is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if !connected {
                        log::info!("mqtt connection re-established");
                        connected = true;
                        if events.send(SessionEvent::Reconnected).is_err() {
                            break;
                        }
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    log::debug!("mqtt disconnect sent, driver exiting");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if connected {
                        log::warn!("mqtt connection lost: {e:}");
                    }
                    connected = false;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

fn reason(e: ClientError) -> String {
    e.to_string()
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        let (client, mut eventloop) =
            AsyncClient::new(Self::mqtt_options(options)?, REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(TransportError::Connect(format!("{:?}", ack.code)));
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
        log::debug!("connected to mqtt server {}", options.url);

        let (tx, rx) = unbounded_channel();
        self.driver = Some(tokio::spawn(Self::drive(eventloop, tx)));
        self.events = Some(rx);
        self.client = Some(client);
        Ok(())
    }

    // Requests wait for room in the request buffer, which stops draining
    // while the broker holds back acknowledgements
    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: reason(e),
            })
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: reason(e),
            })
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Unsubscribe {
                topic: topic.to_string(),
                reason: reason(e),
            })
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.as_mut()?.recv().await
    }

    async fn disconnect(&mut self, linger: Duration) -> Result<(), TransportError> {
        let client = self.client.take().ok_or(TransportError::NotConnected)?;
        self.events = None;
        let res = client
            .try_disconnect()
            .map_err(|e| TransportError::Disconnect(reason(e)));

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(linger, &mut driver).await.is_err() {
                log::warn!("mqtt session did not close within {linger:?}");
                driver.abort();
            }
        }
        res
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }
}
