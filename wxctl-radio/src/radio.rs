use std::sync::Arc;
use tokio::{sync::oneshot, task::JoinHandle, time::Duration};
use wxctlp_frame::{Metric, RadioPacket};

use crate::{
    transceiver::{Frequency, Mode, Transceiver},
    RadioError, RECEIVE_BACKOFF_MILLIS, STOP_TIMEOUT_SECS,
};

/// Invoked from the receive task with the sender's node id and the
/// decoded telemetry
pub type MetricCallback = Arc<dyn Fn(u8, Metric) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Idle,
    Receiving,
    Stopping,
    Stopped,
}

/// Parameters of the current transceiver session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioSession {
    pub network_id: u8,
    pub node_id: u8,
    pub encryption_key: Vec<u8>,
    pub frequency: Option<Frequency>,
    pub running: bool,
}

struct ReceiveTask<T> {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<T>,
}

/// [`RadioClient`] is the radio actor. The transceiver is moved into the
/// receive task while running and handed back when the task exits, so only
/// one task ever touches it.
pub struct RadioClient<T: Transceiver> {
    session: RadioSession,
    transceiver: Option<T>,
    callback: MetricCallback,
    state: RadioState,
    task: Option<ReceiveTask<T>>,
}

impl<T: Transceiver> RadioClient<T> {
    pub fn new<F>(network_id: u8, node_id: u8, transceiver: T, callback: F) -> Self
    where
        F: Fn(u8, Metric) + Send + Sync + 'static,
    {
        Self {
            session: RadioSession {
                network_id,
                node_id,
                encryption_key: vec![],
                frequency: None,
                running: false,
            },
            transceiver: Some(transceiver),
            callback: Arc::new(callback),
            state: RadioState::Idle,
            task: None,
        }
    }

    pub fn state(&self) -> RadioState {
        self.state
    }

    pub fn session(&self) -> &RadioSession {
        &self.session
    }

    /// Open the transceiver, enable encryption, tune it and launch the
    /// receive task.
    pub async fn start(&mut self, encryption_key: &str, frequency: &str) -> Result<(), RadioError> {
        if self.task.is_some() {
            return Err(RadioError::AlreadyRunning);
        }
        let frequency: Frequency = frequency.parse()?;
        let mut transceiver = self
            .transceiver
            .take()
            .ok_or_else(|| RadioError::Open("transceiver was lost by a failed task".to_string()))?;

        if let Err(e) = Self::configure(
            &mut transceiver,
            &self.session,
            encryption_key.as_bytes(),
            frequency,
        )
        .await
        {
            log::error!("Unable to set up transceiver: {e:}");
            self.transceiver = Some(transceiver);
            return Err(e);
        }

        self.session.encryption_key = encryption_key.as_bytes().to_vec();
        self.session.frequency = Some(frequency);
        self.session.running = true;

        let (stop, stop_rx) = oneshot::channel();
        let node_id = self.session.node_id;
        let callback = self.callback.clone();
        let handle = tokio::spawn(async move {
            receive_loop(transceiver, node_id, callback, stop_rx).await
        });

        self.task = Some(ReceiveTask { stop, handle });
        self.state = RadioState::Receiving;
        Ok(())
    }

    async fn configure(
        transceiver: &mut T,
        session: &RadioSession,
        key: &[u8],
        frequency: Frequency,
    ) -> Result<(), RadioError> {
        transceiver.open(session.network_id, session.node_id).await?;
        if let Err(e) = Self::tune(transceiver, key, frequency).await {
            transceiver.close().await.ok();
            return Err(e);
        }
        Ok(())
    }

    async fn tune(
        transceiver: &mut T,
        key: &[u8],
        frequency: Frequency,
    ) -> Result<(), RadioError> {
        transceiver.set_encryption_key(key)?;
        transceiver.set_frequency(frequency)?;
        transceiver.set_mode(Mode::Receiver).await
    }

    /// Signal the receive task, wait for it to hand back the transceiver,
    /// then close the transceiver.
    pub async fn stop(&mut self) -> Result<(), RadioError> {
        let task = self.task.take().ok_or(RadioError::NotStarted)?;
        log::info!("stopping radio subsystem");
        self.state = RadioState::Stopping;

        let ReceiveTask { stop, mut handle } = task;
        // The task may already be gone; the join below reports that
        stop.send(()).ok();

        let wait = Duration::from_secs(STOP_TIMEOUT_SECS);
        let mut transceiver = match tokio::time::timeout(wait, &mut handle).await {
            Ok(Ok(transceiver)) => transceiver,
            Ok(Err(e)) => {
                self.state = RadioState::Stopped;
                self.session.running = false;
                return Err(RadioError::Task(e.to_string()));
            }
            Err(_) => {
                log::error!("radio receive task did not stop within {wait:?}, aborting it");
                handle.abort();
                self.state = RadioState::Stopped;
                self.session.running = false;
                return Err(RadioError::StopTimeout);
            }
        };

        self.session.running = false;
        self.state = RadioState::Stopped;
        let closed = transceiver.close().await;
        self.transceiver = Some(transceiver);
        closed?;
        log::info!("radio subsystem stopped");
        Ok(())
    }
}

async fn receive_loop<T: Transceiver>(
    mut transceiver: T,
    node_id: u8,
    callback: MetricCallback,
    mut stop: oneshot::Receiver<()>,
) -> T {
    log::info!("Radio subsystem started on node {node_id}");
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                break;
            }
            res = transceiver.receive() => {
                match res {
                    Ok(packet) => handle_packet(&mut transceiver, &packet, &callback).await,
                    Err(e) => {
                        log::error!("Radio receive error {e:}");
                        tokio::time::sleep(Duration::from_millis(RECEIVE_BACKOFF_MILLIS)).await;
                    }
                }
            }
        }
    }
    log::debug!("Radio receive loop exiting");
    transceiver
}

async fn handle_packet<T: Transceiver>(
    transceiver: &mut T,
    packet: &RadioPacket,
    callback: &MetricCallback,
) {
    if !packet.is_broadcast() && packet.request_ack {
        // Best effort, the sensor retries on its own
        match transceiver.send(&packet.to_ack()).await {
            Ok(()) => log::debug!("ACK sent to node {}", packet.from),
            Err(e) => log::warn!("Unable to ACK node {}: {e:}", packet.from),
        }
    }

    match Metric::decode(packet.payload()) {
        Ok(metric) => {
            log::trace!("Node {} reported {metric}", packet.from);
            callback(packet.from, metric);
        }
        Err(e) => {
            log::error!("Dropping frame from node {}: {e:}", packet.from);
        }
    }
}
