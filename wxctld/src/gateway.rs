use actix::{Actor, Addr, Context, Handler, Message};
use std::{future::Future, sync::Arc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use wxctl_homie::{ConnectionConfig, HomieDevice};
use wxctldb::{Config, ConfigStore};
use wxctlp_frame::Metric;

use crate::{
    telemetry::{node_name, property_values, SENSOR_NODE_TYPE, SENSOR_PROPERTIES},
    GatewayError,
};

#[derive(Debug)]
pub enum GatewayEvent {
    Report { sensor: u8, metric: Metric },
    ConfigUpdate(String),
}

/// Owns the Homie device and the configuration store. Radio reports and
/// configuration updates reach it as [`GatewayEvent`]s, handled one at a
/// time by [`Gateway::run`].
pub struct Gateway<C: HomieDevice> {
    device: C,
    store: ConfigStore,
    config: Config,
    sender: UnboundedSender<GatewayEvent>,
    events: UnboundedReceiver<GatewayEvent>,
}

impl<C: HomieDevice> Gateway<C> {
    pub fn new(device: C, store: ConfigStore, config: Config) -> Self {
        let (sender, events) = unbounded_channel();
        Self {
            device,
            store,
            config,
            sender,
            events,
        }
    }

    pub fn sender(&self) -> UnboundedSender<GatewayEvent> {
        self.sender.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &C {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut C {
        &mut self.device
    }

    pub fn store(&mut self) -> &mut ConfigStore {
        &mut self.store
    }

    /// Route remote configuration payloads through `handle`; the device
    /// calls back from its session task, which must not wait on us
    pub fn install_config_callback(&self, handle: Addr<GatewayHandle>) {
        self.device.add_config_callback(Arc::new(move |payload: &str| {
            handle.do_send(ConfigUpdate(payload.to_string()))
        }));
    }

    /// Handle events until `shutdown` resolves, then take the device offline
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) -> Result<(), GatewayError> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    log::info!("gateway shutting down");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                }
            }
        }
        self.device.stop().await?;
        Ok(())
    }

    pub async fn handle_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Report { sensor, metric } => self.report(sensor, &metric),
            GatewayEvent::ConfigUpdate(payload) => {
                if let Err(e) = self.apply_config(&payload).await {
                    log::error!("configuration update rejected: {e:}");
                }
            }
        }
    }

    /// Publish a sensor report, creating the sensor's node on first sight
    pub fn report(&self, sensor: u8, metric: &Metric) {
        log::debug!("sensor {sensor}: {metric}");
        let name = node_name(sensor);
        if !self.device.has_node(&name) {
            log::info!("discovered sensor {name}");
            self.device
                .add_node(&name, SENSOR_NODE_TYPE, &SENSOR_PROPERTIES, vec![]);
        }
        for (property, value) in property_values(metric) {
            self.device.set_property(&name, property, &value);
        }
    }

    /// Merge `payload` over the current configuration and apply it. The
    /// MQTT session is only restarted when broker or device settings
    /// changed; if the new settings cannot connect, the previous ones are
    /// restored and nothing is persisted.
    pub async fn apply_config(&mut self, payload: &str) -> Result<(), GatewayError> {
        let merged = self.config.merge(payload)?;
        if merged == self.config {
            log::info!("configuration unchanged");
            return Ok(());
        }
        if merged.radio != self.config.radio {
            log::warn!("radio settings changed, they take effect on the next start");
        }

        if merged.mqtt != self.config.mqtt || merged.homie != self.config.homie {
            if let Err(e) = self
                .device
                .reconfigure(ConnectionConfig::from(&merged))
                .await
            {
                log::error!("new mqtt settings failed ({e:}), restoring previous ones");
                self.device
                    .reconfigure(ConnectionConfig::from(&self.config))
                    .await?;
                return Err(e.into());
            }
        }

        self.store.save(&merged)?;
        self.config = merged;
        log::info!("configuration updated");
        Ok(())
    }
}

/// Actor address handed to callbacks that run on other tasks (the radio
/// receive loop, the MQTT session). Its handlers only forward into the
/// gateway's event channel.
pub struct GatewayHandle {
    events: UnboundedSender<GatewayEvent>,
}

impl GatewayHandle {
    pub fn new(events: UnboundedSender<GatewayEvent>) -> Self {
        Self { events }
    }

    fn forward(&self, event: GatewayEvent) {
        if let Err(e) = self.events.send(event) {
            log::error!("gateway is gone, dropping {:?}", e.0);
        }
    }
}

impl Actor for GatewayHandle {
    type Context = Context<Self>;
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct SensorReport {
    pub sensor: u8,
    pub metric: Metric,
}

impl Handler<SensorReport> for GatewayHandle {
    type Result = ();

    fn handle(&mut self, msg: SensorReport, _ctx: &mut Self::Context) -> Self::Result {
        self.forward(GatewayEvent::Report {
            sensor: msg.sensor,
            metric: msg.metric,
        })
    }
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct ConfigUpdate(pub String);

impl Handler<ConfigUpdate> for GatewayHandle {
    type Result = ();

    fn handle(&mut self, msg: ConfigUpdate, _ctx: &mut Self::Context) -> Self::Result {
        self.forward(GatewayEvent::ConfigUpdate(msg.0))
    }
}
