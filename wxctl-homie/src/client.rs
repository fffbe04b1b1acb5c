use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval_at, timeout, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    transport::{InboundMessage, LastWill, SessionEvent, SessionOptions, TlsIdentity},
    ConfigCallback, ConnectionConfig, DeviceIdentity, DeviceTree, HomieError, InboundHandler,
    InterfaceSource, MqttTransport, Node, OperationError, OperationId, OperationQueue,
    PendingOperation, SettableProperty, UpdateOrigin, CONFIG_SET_TOPIC, CONNECT_ATTEMPTS,
    CONNECT_RETRY_DELAY, DISCONNECT_LINGER, FIRMWARE_VERSION, HOMIE_VERSION, IMPLEMENTATION,
    KEEP_ALIVE, OPERATION_QUEUE_DEPTH, STATS_INTERVAL, STOP_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Restarting,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle on the running session task. The task hands the transport and the
/// queue receiver back when it exits so the client can start again.
struct Session<T> {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<(T, mpsc::Receiver<PendingOperation>)>,
}

/// Homie device client owning one broker session at a time.
///
/// All topic operations go through an [`OperationQueue`] and are executed by
/// the session task, so the client itself is never blocked on the broker.
/// The device tree and the registered configuration callbacks survive
/// [`HomieClient::stop`], which is what lets [`HomieClient::restart`] bring
/// the device back exactly as it was.
pub struct HomieClient<T: MqttTransport> {
    config: ConnectionConfig,
    interfaces: Box<dyn InterfaceSource>,
    identity: Option<DeviceIdentity>,
    transport: Option<T>,
    queue: OperationQueue,
    queue_rx: Option<mpsc::Receiver<PendingOperation>>,
    tree: Arc<Mutex<DeviceTree>>,
    config_callbacks: Arc<Mutex<Vec<ConfigCallback>>>,
    state: ConnectionState,
    session: Option<Session<T>>,
    shutdown: CancellationToken,
}

impl<T: MqttTransport> HomieClient<T> {
    pub fn new(
        config: ConnectionConfig,
        transport: T,
        interfaces: impl InterfaceSource + 'static,
    ) -> Self {
        let (queue, queue_rx) = OperationQueue::new(OPERATION_QUEUE_DEPTH);
        Self {
            config,
            interfaces: Box::new(interfaces),
            identity: None,
            transport: Some(transport),
            queue,
            queue_rx: Some(queue_rx),
            tree: Arc::new(Mutex::new(DeviceTree::default())),
            config_callbacks: Arc::new(Mutex::new(vec![])),
            state: ConnectionState::Disconnected,
            session: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token aborts a connect retry loop in progress
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Homie device id, known once the client has been started
    pub fn id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.id.as_str())
    }

    pub fn name(&self) -> &str {
        &self.config.device_name
    }

    pub fn url(&self) -> String {
        self.config.url()
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.identity.as_ref().map(|i| i.ip)
    }

    pub fn mac(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.mac.as_str())
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn firmware_name(&self) -> &str {
        &self.config.firmware_name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Snapshot of the device tree
    pub fn nodes(&self) -> BTreeMap<String, Node> {
        lock(&self.tree).nodes().clone()
    }

    pub fn has_node(&self, name: &str) -> bool {
        lock(&self.tree).get(name).is_some()
    }

    /// Connect to the broker, announce the device and spawn the session task.
    ///
    /// The connect attempt is retried [`CONNECT_ATTEMPTS`] times,
    /// [`CONNECT_RETRY_DELAY`] apart; cancelling the shutdown token stops
    /// the retries with [`HomieError::Shutdown`].
    pub async fn start(&mut self) -> Result<(), HomieError> {
        if self.session.is_some() {
            log::warn!("mqtt session already running");
            return Ok(());
        }
        let url = self.config.url();
        let identity = DeviceIdentity::derive(self.interfaces.as_ref(), &self.config)?;
        let device_prefix = identity.device_prefix(&self.config.prefix);
        log::info!("homie device id {} ({}, {})", identity.id, identity.mac, identity.ip);

        let options = SessionOptions {
            url: url.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            client_id: identity.id.clone(),
            keep_alive: KEEP_ALIVE,
            will: LastWill {
                topic: format!("{device_prefix}$online"),
                payload: "false".to_string(),
                retain: true,
            },
            tls: load_tls(&self.config).await?,
        };

        let mut transport = self.transport.take().ok_or(HomieError::TransportUnavailable)?;
        let queue_rx = match self.queue_rx.take() {
            Some(rx) => rx,
            None => {
                self.transport = Some(transport);
                return Err(HomieError::TransportUnavailable);
            }
        };

        self.state = ConnectionState::Connecting;
        if let Err(e) = connect(&mut transport, &options, &self.shutdown).await {
            self.transport = Some(transport);
            self.queue_rx = Some(queue_rx);
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }
        let connected_at = Instant::now();
        log::info!("connected to {url}");

        let handlers = announce(&mut transport, &device_prefix, &self.config, &identity).await;

        let (stop, stop_rx) = oneshot::channel();
        let task = SessionTask {
            transport,
            ops: queue_rx,
            stop: stop_rx,
            prefix: device_prefix,
            handlers,
            tree: self.tree.clone(),
            config_callbacks: self.config_callbacks.clone(),
            connected_at,
        };
        self.session = Some(Session {
            stop,
            handle: tokio::spawn(task.run()),
        });
        self.identity = Some(identity);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Ask the session task to go offline and wait for it, at most
    /// [`STOP_TIMEOUT`]. Operations still queued stay queued for the next
    /// start.
    pub async fn stop(&mut self) -> Result<(), HomieError> {
        let Session { stop, mut handle } = self.session.take().ok_or(HomieError::NotStarted)?;
        // An error here means the task already ended; joining reports it
        let _ = stop.send(());

        let res = match timeout(STOP_TIMEOUT, &mut handle).await {
            Ok(Ok((transport, queue_rx))) => {
                self.transport = Some(transport);
                self.queue_rx = Some(queue_rx);
                log::info!("mqtt session stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(HomieError::Task(e.to_string())),
            Err(_) => {
                handle.abort();
                Err(HomieError::StopTimeout)
            }
        };
        self.state = ConnectionState::Disconnected;
        res
    }

    /// Stop, start again with the current configuration, then republish
    /// every known node
    pub async fn restart(&mut self) -> Result<(), HomieError> {
        log::info!("restarting mqtt session");
        self.state = ConnectionState::Restarting;
        match self.stop().await {
            Ok(()) | Err(HomieError::NotStarted) => {}
            Err(e) => return Err(e),
        }
        self.start().await?;

        let nodes = self.nodes();
        for node in nodes.values() {
            self.publish_node(node);
        }
        log::debug!("republished {} nodes", nodes.len());
        Ok(())
    }

    /// Replace the connection configuration and restart with it
    pub async fn reconfigure(&mut self, config: ConnectionConfig) -> Result<(), HomieError> {
        log::info!("reconfiguring mqtt: {} -> {}", self.config.url(), config.url());
        self.config = config;
        self.restart().await
    }

    /// Create the node unless it exists and announce it. Returns `false`
    /// when a node with that name was already present.
    pub fn add_node(
        &self,
        name: &str,
        node_type: &str,
        properties: &[&str],
        settables: Vec<SettableProperty>,
    ) -> bool {
        let node = {
            let mut tree = lock(&self.tree);
            if tree.get(name).is_some() {
                return false;
            }
            tree.insert(Node::new(name, node_type, properties, settables, self.queue.clone()))
                .clone()
        };
        self.publish_node(&node);
        true
    }

    fn publish_node(&self, node: &Node) {
        let name = node.name();
        let _ = self.queue.publish(format!("{name}/$type"), node.node_type());
        let _ = self
            .queue
            .publish(format!("{name}/$properties"), node.property_list());
        for settable in node.settables() {
            let property = settable.name.clone();
            let _ = self.queue.subscribe(
                format!("{name}/{property}/set"),
                InboundHandler::SettableCommand {
                    node: name.to_string(),
                    property: property.clone(),
                },
            );
            let _ = self.queue.subscribe(
                format!("{name}/{property}"),
                InboundHandler::RestoreRetained {
                    node: name.to_string(),
                    property,
                },
            );
        }
    }

    /// Local update of a node property. The session task stores and
    /// publishes the value in queue order; `None` when the node is unknown
    /// or the update could not be queued.
    pub fn set_property(&self, node: &str, property: &str, value: &str) -> Option<OperationId> {
        if !self.has_node(node) {
            log::warn!("set {property} on unknown node {node}");
            return None;
        }
        self.queue.set_property(node, property, value).ok()
    }

    /// Retained publish on a topic relative to the device prefix
    pub fn publish(&self, topic: &str, payload: &str) -> Result<OperationId, OperationError> {
        self.queue.publish(topic, payload)
    }

    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Result<OperationId, OperationError>
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.queue
            .subscribe(topic, InboundHandler::Callback(Arc::new(callback)))
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<OperationId, OperationError> {
        self.queue.unsubscribe(topic)
    }

    /// Register a receiver for `$implementation/config/set` payloads. It
    /// stays registered across restarts and must not block.
    pub fn add_config_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.config_callbacks).push(Arc::new(callback));
    }
}

/// Connect with bounded retries; cancelling `shutdown` ends the retries
async fn connect<T: MqttTransport>(
    transport: &mut T,
    options: &SessionOptions,
    shutdown: &CancellationToken,
) -> Result<(), HomieError> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                return Err(HomieError::Shutdown { url: options.url.clone() });
            }
            res = transport.connect(options) => match res {
                Ok(()) => return Ok(()),
                Err(e) => log::warn!(
                    "mqtt connect attempt {attempt}/{CONNECT_ATTEMPTS} to {} failed: {e:}",
                    options.url
                ),
            }
        }
        if attempt < CONNECT_ATTEMPTS {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return Err(HomieError::Shutdown { url: options.url.clone() });
                }
                _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
            }
        }
    }
    Err(HomieError::Connection {
        url: options.url.clone(),
    })
}

/// TLS material for an `ssl://` session. The CA is optional, a configured
/// private key adds the client certificate and then requires the CA too.
async fn load_tls(config: &ConnectionConfig) -> Result<Option<TlsIdentity>, HomieError> {
    if !config.tls_enabled() {
        return Ok(None);
    }
    let tls = &config.tls;
    let ca = match tls.ca.as_deref() {
        Some(path) => Some(read_pem(path).await?),
        None => None,
    };
    let client_auth = if config.client_auth_enabled() {
        configured(tls.ca.as_deref(), "CA certificate")?;
        log::debug!("loading client certificate for mutual TLS");
        Some((
            read_pem(configured(tls.client_cert.as_deref(), "client certificate")?).await?,
            read_pem(configured(tls.private_key.as_deref(), "private key")?).await?,
        ))
    } else {
        None
    };
    Ok(Some(TlsIdentity { ca, client_auth }))
}

fn configured<'a>(path: Option<&'a Path>, what: &str) -> Result<&'a Path, HomieError> {
    path.ok_or_else(|| HomieError::Tls(format!("no {what} configured")))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, HomieError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| HomieError::Tls(format!("{}: {e:}", path.display())))
}

/// Publish the device attributes in their fixed order, subscribe to remote
/// configuration, then go online. Returns the handler table the session
/// starts with.
async fn announce<T: MqttTransport>(
    transport: &mut T,
    prefix: &str,
    config: &ConnectionConfig,
    identity: &DeviceIdentity,
) -> HashMap<String, InboundHandler> {
    let attributes = [
        ("$homie", HOMIE_VERSION.to_string()),
        ("$name", config.device_name.clone()),
        ("$mac", identity.mac.clone()),
        ("$stats/interval", STATS_INTERVAL.as_secs().to_string()),
        ("$localip", identity.ip.to_string()),
        ("$fw/name", config.firmware_name.clone()),
        ("$fw/version", FIRMWARE_VERSION.to_string()),
        ("$implementation", IMPLEMENTATION.to_string()),
    ];
    for (suffix, value) in attributes {
        let topic = format!("{prefix}{suffix}");
        if let Err(e) = transport.publish(&topic, &value, true).await {
            log::error!("announcement of {topic} failed: {e:}");
        }
    }

    let mut handlers = HashMap::new();
    let config_topic = format!("{prefix}{CONFIG_SET_TOPIC}");
    if let Err(e) = transport.subscribe(&config_topic).await {
        log::error!("{e:}");
    }
    handlers.insert(config_topic, InboundHandler::Config);

    if let Err(e) = transport.publish(&format!("{prefix}$online"), "true", true).await {
        log::error!("announcement of $online failed: {e:}");
    }
    handlers
}

struct SessionTask<T> {
    transport: T,
    ops: mpsc::Receiver<PendingOperation>,
    stop: oneshot::Receiver<()>,
    prefix: String,
    handlers: HashMap<String, InboundHandler>,
    tree: Arc<Mutex<DeviceTree>>,
    config_callbacks: Arc<Mutex<Vec<ConfigCallback>>>,
    connected_at: Instant,
}

impl<T: MqttTransport> SessionTask<T> {
    async fn run(mut self) -> (T, mpsc::Receiver<PendingOperation>) {
        let mut heartbeat = interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
        let mut inbound_open = true;

        loop {
            tokio::select! {
                biased;
                _ = &mut self.stop => break,
                op = self.ops.recv() => match op {
                    Some(op) => self.process(op).await,
                    None => break,
                },
                event = self.transport.next_event(), if inbound_open => match event {
                    Some(SessionEvent::Message(msg)) => self.dispatch(msg).await,
                    Some(SessionEvent::Reconnected) => self.resume().await,
                    None => {
                        log::warn!("mqtt inbound stream closed");
                        inbound_open = false;
                    }
                },
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }

        self.go_offline().await;
        (self.transport, self.ops)
    }

    async fn process(&mut self, op: PendingOperation) {
        match op {
            PendingOperation::Publish { id, topic, payload } => {
                log::trace!("processing publication id {id}");
                let topic = format!("{}{topic}", self.prefix);
                if let Err(e) = self.transport.publish(&topic, &payload, true).await {
                    log::error!("publication id {id} dropped: {e:}");
                }
            }
            PendingOperation::Subscribe { id, topic, handler } => {
                log::trace!("processing subscription id {id}");
                let topic = format!("{}{topic}", self.prefix);
                match self.transport.subscribe(&topic).await {
                    Ok(()) => {
                        self.handlers.insert(topic, handler);
                    }
                    Err(e) => log::error!("subscription id {id} dropped: {e:}"),
                }
            }
            PendingOperation::Unsubscribe { id, topic } => {
                log::trace!("processing unsubscription id {id}");
                let topic = format!("{}{topic}", self.prefix);
                self.handlers.remove(&topic);
                if let Err(e) = self.transport.unsubscribe(&topic).await {
                    log::error!("unsubscription id {id} dropped: {e:}");
                }
            }
            PendingOperation::SetProperty {
                id,
                node,
                property,
                value,
            } => {
                log::trace!("processing property update id {id}");
                let known = lock(&self.tree)
                    .get_mut(&node)
                    .map(|n| n.store(&property, &value))
                    .is_some();
                if !known {
                    log::warn!("property update id {id} dropped: node {node} is gone");
                    return;
                }
                let topic = format!("{}{node}/{property}", self.prefix);
                if let Err(e) = self.transport.publish(&topic, &value, true).await {
                    log::error!("property update id {id} dropped: {e:}");
                }
            }
        }
    }

    async fn dispatch(&mut self, msg: InboundMessage) {
        let Some(handler) = self.handlers.get(&msg.topic).cloned() else {
            log::debug!("no handler for {}", msg.topic);
            return;
        };
        log::debug!("inbound {} ({handler:?})", msg.topic);

        match handler {
            InboundHandler::SettableCommand { node, property } => {
                let callback = {
                    let mut tree = lock(&self.tree);
                    tree.get_mut(&node)
                        .and_then(|n| n.set(&property, &msg.payload, UpdateOrigin::Remote).1)
                };
                if let Some(callback) = callback {
                    callback(&msg.payload);
                }
            }
            InboundHandler::RestoreRetained { node, property } => {
                {
                    let mut tree = lock(&self.tree);
                    if let Some(n) = tree.get_mut(&node) {
                        n.set(&property, &msg.payload, UpdateOrigin::Restore);
                    }
                }
                self.handlers.remove(&msg.topic);
                if let Err(e) = self.transport.unsubscribe(&msg.topic).await {
                    log::error!("{e:}");
                }
            }
            InboundHandler::Config => {
                let callbacks = lock(&self.config_callbacks).clone();
                for callback in callbacks {
                    callback(&msg.payload);
                }
            }
            InboundHandler::Callback(callback) => callback(&msg.topic, &msg.payload),
        }
    }

    /// The broker may have fired the will while the library reconnected:
    /// subscriptions are renewed and the device goes online again
    async fn resume(&mut self) {
        log::info!("mqtt session resumed, renewing {} subscriptions", self.handlers.len());
        let topics = self.handlers.keys().cloned().collect::<Vec<_>>();
        for topic in topics {
            if let Err(e) = self.transport.subscribe(&topic).await {
                log::error!("{e:}");
            }
        }
        let online = format!("{}$online", self.prefix);
        if let Err(e) = self.transport.publish(&online, "true", true).await {
            log::error!("{e:}");
        }
    }

    async fn heartbeat(&mut self) {
        let uptime = self.connected_at.elapsed().as_secs().to_string();
        let topic = format!("{}$stats/uptime", self.prefix);
        if let Err(e) = self.transport.publish(&topic, &uptime, true).await {
            log::error!("heartbeat dropped: {e:}");
        }
    }

    async fn go_offline(&mut self) {
        let online = format!("{}$online", self.prefix);
        if let Err(e) = self.transport.publish(&online, "false", true).await {
            log::error!("{e:}");
        }
        if let Err(e) = self.transport.disconnect(DISCONNECT_LINGER).await {
            log::error!("{e:}");
        }
    }
}

/// Device capabilities the gateway relies on, implemented by
/// [`HomieClient`]
#[async_trait]
pub trait HomieDevice: Send {
    async fn start(&mut self) -> Result<(), HomieError>;
    async fn stop(&mut self) -> Result<(), HomieError>;
    async fn reconfigure(&mut self, config: ConnectionConfig) -> Result<(), HomieError>;
    fn has_node(&self, name: &str) -> bool;
    fn add_node(
        &self,
        name: &str,
        node_type: &str,
        properties: &[&str],
        settables: Vec<SettableProperty>,
    ) -> bool;
    fn set_property(&self, node: &str, property: &str, value: &str) -> Option<OperationId>;
    fn add_config_callback(&self, callback: ConfigCallback);
}

#[async_trait]
impl<T: MqttTransport> HomieDevice for HomieClient<T> {
    async fn start(&mut self) -> Result<(), HomieError> {
        HomieClient::start(self).await
    }

    async fn stop(&mut self) -> Result<(), HomieError> {
        HomieClient::stop(self).await
    }

    async fn reconfigure(&mut self, config: ConnectionConfig) -> Result<(), HomieError> {
        HomieClient::reconfigure(self, config).await
    }

    fn has_node(&self, name: &str) -> bool {
        HomieClient::has_node(self, name)
    }

    fn add_node(
        &self,
        name: &str,
        node_type: &str,
        properties: &[&str],
        settables: Vec<SettableProperty>,
    ) -> bool {
        HomieClient::add_node(self, name, node_type, properties, settables)
    }

    fn set_property(&self, node: &str, property: &str, value: &str) -> Option<OperationId> {
        HomieClient::set_property(self, node, property, value)
    }

    fn add_config_callback(&self, callback: ConfigCallback) {
        lock(&self.config_callbacks).push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        transport::testing::{MemoryTransport, Record, Recorder},
        IdentityError, NetworkInterface,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::{sync::mpsc::UnboundedSender, time::Duration};

    const PREFIX: &str = "devices/b827eb123456/";

    struct Fixed;

    impl InterfaceSource for Fixed {
        fn interfaces(&self) -> Result<Vec<NetworkInterface>, IdentityError> {
            Ok(vec![NetworkInterface {
                name: "eth0".to_string(),
                mac: "B8:27:EB:12:34:56".to_string(),
                addrs: vec!["192.168.1.20".parse().unwrap()],
            }])
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            host: "broker.local".to_string(),
            ssl: false,
            ..Default::default()
        }
    }

    fn client() -> (
        HomieClient<MemoryTransport>,
        UnboundedSender<SessionEvent>,
        Recorder,
    ) {
        let (transport, inbound, recorder) = MemoryTransport::new();
        (HomieClient::new(config(), transport, Fixed), inbound, recorder)
    }

    fn publish(suffix: &str, payload: &str) -> Record {
        Record::Publish {
            topic: format!("{PREFIX}{suffix}"),
            payload: payload.to_string(),
            retain: true,
        }
    }

    fn message(suffix: &str, payload: &str) -> SessionEvent {
        SessionEvent::Message(InboundMessage {
            topic: format!("{PREFIX}{suffix}"),
            payload: payload.to_string(),
        })
    }

    // Let the session task drain whatever is ready
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn announces_in_order_with_online_last() {
        let (mut client, _inbound, recorder) = client();
        client.start().await.unwrap();

        let records = recorder.records();
        match &records[0] {
            Record::Connect(options) => {
                assert_eq!(options.client_id, "b827eb123456");
                assert_eq!(options.url, "tcp://broker.local:1883");
                assert_eq!(options.keep_alive, Duration::from_secs(10));
                assert_eq!(options.will.topic, format!("{PREFIX}$online"));
                assert_eq!(options.will.payload, "false");
                assert!(options.will.retain);
                assert!(options.tls.is_none());
            }
            r => panic!("expected connect, got {r:?}"),
        }
        assert_eq!(
            records[1..].to_vec(),
            vec![
                publish("$homie", "2.0.0"),
                publish("$name", "weatherStation"),
                publish("$mac", "B8:27:EB:12:34:56"),
                publish("$stats/interval", "10"),
                publish("$localip", "192.168.1.20"),
                publish("$fw/name", "weathercontroller"),
                publish("$fw/version", "0.0.1"),
                publish("$implementation", "vx-go-homie"),
                Record::Subscribe(format!("{PREFIX}$implementation/config/set")),
                publish("$online", "true"),
            ]
        );
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.id(), Some("b827eb123456"));
        assert_eq!(client.mac(), Some("B8:27:EB:12:34:56"));
    }

    #[tokio::test(start_paused = true)]
    async fn goes_offline_before_disconnect() {
        let (mut client, _inbound, recorder) = client();
        client.start().await.unwrap();
        recorder.clear();

        client.stop().await.unwrap();
        assert_eq!(
            recorder.records(),
            vec![publish("$online", "false"), Record::Disconnect]
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(client.stop().await, Err(HomieError::NotStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_connect_with_fixed_delay() {
        let (transport, _inbound, recorder) = MemoryTransport::new();
        *transport.failures.lock().unwrap() = 3;
        let mut client = HomieClient::new(config(), transport, Fixed);

        let begin = Instant::now();
        client.start().await.unwrap();
        assert!(begin.elapsed() >= Duration::from_secs(15));
        assert!(begin.elapsed() < Duration::from_secs(16));
        assert!(matches!(recorder.records()[0], Record::Connect(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let (transport, _inbound, recorder) = MemoryTransport::new();
        *transport.failures.lock().unwrap() = CONNECT_ATTEMPTS;
        let mut client = HomieClient::new(config(), transport, Fixed);

        match client.start().await {
            Err(HomieError::Connection { url }) => assert_eq!(url, "tcp://broker.local:1883"),
            r => panic!("unexpected {r:?}"),
        }
        assert!(recorder.records().is_empty());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        // The transport is handed back, a later start can still succeed
        client.start().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_retries() {
        let (transport, _inbound, _recorder) = MemoryTransport::new();
        *transport.failures.lock().unwrap() = 100;
        let mut client = HomieClient::new(config(), transport, Fixed);

        let token = client.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            token.cancel();
        });

        let begin = Instant::now();
        assert!(matches!(
            client.start().await,
            Err(HomieError::Shutdown { .. })
        ));
        assert!(begin.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_every_interval() {
        let (mut client, _inbound, recorder) = client();
        client.start().await.unwrap();
        recorder.clear();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(
            recorder.records(),
            vec![publish("$stats/uptime", "10"), publish("$stats/uptime", "20")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn add_node_announces_and_subscribes() {
        let (mut client, _inbound, recorder) = client();
        client.start().await.unwrap();
        recorder.clear();

        assert!(client.add_node(
            "relay",
            "switch",
            &["power"],
            vec![SettableProperty::new("on", |_| {})],
        ));
        assert!(!client.add_node("relay", "other", &[], vec![]));
        settle().await;

        assert_eq!(
            recorder.records(),
            vec![
                publish("relay/$type", "switch"),
                publish("relay/$properties", "power,on:settable"),
                Record::Subscribe(format!("{PREFIX}relay/on/set")),
                Record::Subscribe(format!("{PREFIX}relay/on")),
            ]
        );
        assert_eq!(client.nodes()["relay"].node_type(), "switch");
    }

    #[tokio::test(start_paused = true)]
    async fn nodes_lists_every_added_name() {
        let (client, _inbound, _recorder) = client();
        for name in ["3", "7", "12"] {
            client.add_node(name, "weather_sensor", &["temperature", "humidity"], vec![]);
        }
        let nodes = client.nodes();
        assert_eq!(nodes.keys().collect::<Vec<_>>(), vec!["12", "3", "7"]);
        for node in nodes.values() {
            assert_eq!(node.properties(), vec!["temperature", "humidity"]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settable_command_updates_and_fires_callback() {
        let (mut client, inbound, recorder) = client();
        let fired = Arc::new(Mutex::new(vec![]));
        let f = fired.clone();
        client.add_node(
            "relay",
            "switch",
            &[],
            vec![SettableProperty::new("on", move |p| f.lock().unwrap().push(p.to_string()))],
        );
        client.start().await.unwrap();
        settle().await;
        recorder.clear();

        inbound.send(message("relay/on/set", "true")).unwrap();
        settle().await;

        assert_eq!(*fired.lock().unwrap(), vec!["true"]);
        assert_eq!(recorder.records(), vec![publish("relay/on", "true")]);
        assert_eq!(client.nodes()["relay"].value("on"), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn retained_value_is_restored_once() {
        let (mut client, inbound, recorder) = client();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        client.add_node(
            "relay",
            "switch",
            &[],
            vec![SettableProperty::new("on", move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })],
        );
        client.start().await.unwrap();
        settle().await;
        recorder.clear();

        inbound.send(message("relay/on", "false")).unwrap();
        settle().await;
        inbound.send(message("relay/on", "true")).unwrap();
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(client.nodes()["relay"].value("on"), Some("false"));
        let records = recorder.records();
        assert!(records.contains(&Record::Unsubscribe(format!("{PREFIX}relay/on"))));
    }

    #[tokio::test(start_paused = true)]
    async fn config_payload_reaches_every_callback() {
        let (mut client, inbound, _recorder) = client();
        let seen = Arc::new(Mutex::new(vec![]));
        for _ in 0..2 {
            let s = seen.clone();
            client.add_config_callback(move |p| s.lock().unwrap().push(p.to_string()));
        }
        client.start().await.unwrap();

        inbound
            .send(message("$implementation/config/set", r#"{"mqtt":{"port":8883}}"#))
            .unwrap();
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn topic_callback_and_unsubscribe() {
        let (mut client, inbound, recorder) = client();
        let seen = Arc::new(Mutex::new(vec![]));
        let s = seen.clone();
        client.start().await.unwrap();
        client
            .subscribe("ota/firmware", move |t, p| {
                s.lock().unwrap().push((t.to_string(), p.to_string()))
            })
            .unwrap();
        settle().await;

        inbound.send(message("ota/firmware", "v2")).unwrap();
        settle().await;
        client.unsubscribe("ota/firmware").unwrap();
        settle().await;
        inbound.send(message("ota/firmware", "v3")).unwrap();
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(format!("{PREFIX}ota/firmware"), "v2".to_string())]
        );
        assert!(recorder
            .records()
            .contains(&Record::Unsubscribe(format!("{PREFIX}ota/firmware"))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_renews_subscriptions_and_online() {
        let (mut client, inbound, recorder) = client();
        client.start().await.unwrap();
        recorder.clear();

        inbound.send(SessionEvent::Reconnected).unwrap();
        settle().await;
        assert_eq!(
            recorder.records(),
            vec![
                Record::Subscribe(format!("{PREFIX}$implementation/config/set")),
                publish("$online", "true"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restart_republishes_nodes() {
        let (mut client, _inbound, recorder) = client();
        client.start().await.unwrap();
        client.add_node("7", "weather_sensor", &["temperature", "humidity"], vec![]);
        client.add_node("3", "weather_sensor", &["temperature", "humidity"], vec![]);
        settle().await;
        recorder.clear();

        client.restart().await.unwrap();
        settle().await;

        let published = recorder.published();
        let online = published
            .iter()
            .position(|(t, p)| t == &format!("{PREFIX}$online") && p == "true")
            .unwrap();
        for node in ["3", "7"] {
            let at = published
                .iter()
                .position(|(t, p)| {
                    t == &format!("{PREFIX}{node}/$properties") && p == "temperature,humidity"
                })
                .unwrap();
            assert!(at > online);
        }
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_cycles_once_and_keeps_nodes() {
        let (mut client, _inbound, recorder) = client();
        client.start().await.unwrap();
        client.add_node("7", "weather_sensor", &["temperature"], vec![]);
        settle().await;
        recorder.clear();

        let mut next = config();
        next.host = "10.0.0.5".to_string();
        next.port = 8883;
        client.reconfigure(next).await.unwrap();
        settle().await;

        let records = recorder.records();
        let connects = records
            .iter()
            .filter_map(|r| match r {
                Record::Connect(o) => Some(o.url.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(connects, vec!["tcp://10.0.0.5:8883"]);
        assert_eq!(
            records.iter().filter(|r| **r == Record::Disconnect).count(),
            1
        );
        assert_eq!(client.url(), "tcp://10.0.0.5:8883");
        assert!(client.has_node("7"));
        assert!(recorder
            .published()
            .contains(&(format!("{PREFIX}7/$type"), "weather_sensor".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_tls_material_fails_fast() {
        let (transport, _inbound, recorder) = MemoryTransport::new();
        let mut cfg = config();
        cfg.ssl = true;
        cfg.tls.ca = Some("/nonexistent/ca.pem".into());
        cfg.tls.private_key = Some("/nonexistent/key.pem".into());
        let mut client = HomieClient::new(cfg, transport, Fixed);

        assert!(matches!(client.start().await, Err(HomieError::Tls(_))));
        assert!(recorder.records().is_empty());
    }

    fn connect_options(recorder: &Recorder) -> SessionOptions {
        match recorder.records().into_iter().next() {
            Some(Record::Connect(options)) => options,
            r => panic!("expected connect, got {r:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ssl_without_client_key_still_uses_tls() {
        let (transport, _inbound, recorder) = MemoryTransport::new();
        let mut cfg = config();
        cfg.ssl = true;
        let mut client = HomieClient::new(cfg, transport, Fixed);
        client.start().await.unwrap();

        let options = connect_options(&recorder);
        assert_eq!(options.url, "ssl://broker.local:1883");
        assert_eq!(options.tls, Some(TlsIdentity::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn ssl_with_client_key_loads_the_pair() {
        let dir = std::env::temp_dir().join(format!("wxctl-tls-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for (file, pem) in [("ca.pem", "CA"), ("cert.pem", "CERT"), ("key.pem", "KEY")] {
            std::fs::write(dir.join(file), pem).unwrap();
        }

        let (transport, _inbound, recorder) = MemoryTransport::new();
        let mut cfg = config();
        cfg.ssl = true;
        cfg.tls.ca = Some(dir.join("ca.pem"));
        cfg.tls.client_cert = Some(dir.join("cert.pem"));
        cfg.tls.private_key = Some(dir.join("key.pem"));
        let mut client = HomieClient::new(cfg, transport, Fixed);
        client.start().await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(
            connect_options(&recorder).tls,
            Some(TlsIdentity {
                ca: Some(b"CA".to_vec()),
                client_auth: Some((b"CERT".to_vec(), b"KEY".to_vec())),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn client_key_is_ignored_without_ssl() {
        let (transport, _inbound, recorder) = MemoryTransport::new();
        let mut cfg = config();
        cfg.tls.private_key = Some("/nonexistent/key.pem".into());
        let mut client = HomieClient::new(cfg, transport, Fixed);
        client.start().await.unwrap();

        let options = connect_options(&recorder);
        assert_eq!(options.url, "tcp://broker.local:1883");
        assert!(options.tls.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_name_is_announced_as_configured() {
        let (transport, _inbound, recorder) = MemoryTransport::new();
        let mut cfg = config();
        cfg.firmware_name = "WeatherCtl-RPi".to_string();
        let mut client = HomieClient::new(cfg, transport, Fixed);
        client.start().await.unwrap();

        assert!(recorder.records().contains(&publish("$fw/name", "WeatherCtl-RPi")));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_restores_settable_subscriptions() {
        let (mut client, inbound, recorder) = client();
        let fired = Arc::new(Mutex::new(vec![]));
        let f = fired.clone();
        client.add_node(
            "relay",
            "switch",
            &[],
            vec![SettableProperty::new("on", move |p| f.lock().unwrap().push(p.to_string()))],
        );
        client.start().await.unwrap();
        settle().await;
        recorder.clear();

        client.restart().await.unwrap();
        settle().await;
        let set_topic = Record::Subscribe(format!("{PREFIX}relay/on/set"));
        assert_eq!(
            recorder.records().iter().filter(|r| **r == set_topic).count(),
            1
        );

        inbound.send(message("relay/on/set", "true")).unwrap();
        settle().await;
        assert_eq!(*fired.lock().unwrap(), vec!["true"]);
        assert_eq!(client.nodes()["relay"].value("on"), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_gives_up_when_disconnect_hangs() {
        let (mut transport, _inbound, recorder) = MemoryTransport::new();
        transport.hang_on_disconnect = true;
        let mut client = HomieClient::new(config(), transport, Fixed);
        client.start().await.unwrap();
        recorder.clear();

        let begin = Instant::now();
        assert!(matches!(client.stop().await, Err(HomieError::StopTimeout)));
        assert!(begin.elapsed() >= STOP_TIMEOUT);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(recorder.records(), vec![publish("$online", "false")]);

        // The aborted session took the transport with it
        assert!(matches!(
            client.start().await,
            Err(HomieError::TransportUnavailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn set_property_is_applied_by_the_session() {
        let (mut client, _inbound, recorder) = client();
        client.start().await.unwrap();
        client.add_node("7", "weather_sensor", &["temperature"], vec![]);
        settle().await;
        recorder.clear();

        assert!(client.set_property("7", "temperature", "21.50").is_some());
        assert_eq!(client.nodes()["7"].value("temperature"), Some(""));
        settle().await;

        assert_eq!(client.nodes()["7"].value("temperature"), Some("21.50"));
        assert_eq!(recorder.records(), vec![publish("7/temperature", "21.50")]);
        assert!(client.set_property("12", "temperature", "1.00").is_none());
    }
}
