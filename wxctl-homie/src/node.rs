use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{OperationId, OperationQueue};

/// Fired with the raw payload when a settable property is changed remotely
pub type SettableCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct SettableProperty {
    pub name: String,
    pub callback: SettableCallback,
}

impl SettableProperty {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Arc::new(callback),
        }
    }
}

impl fmt::Debug for SettableProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettableProperty")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Where a property update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Set by the gateway itself (e.g. new telemetry)
    Local,
    /// `<node>/<property>/set` command from the broker
    Remote,
    /// Retained value recovered from the broker on (re)connect
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: String,
    pub settable: bool,
}

/// [`Node`] is one logical component of the device, here one sensor. Every
/// update is published retained through the owning client's queue.
#[derive(Clone)]
pub struct Node {
    name: String,
    node_type: String,
    properties: Vec<Property>,
    settables: Vec<SettableProperty>,
    queue: OperationQueue,
}

impl Node {
    pub(crate) fn new(
        name: &str,
        node_type: &str,
        properties: &[&str],
        settables: Vec<SettableProperty>,
        queue: OperationQueue,
    ) -> Self {
        let mut props = properties
            .iter()
            .map(|p| Property {
                name: p.to_string(),
                value: String::new(),
                settable: false,
            })
            .collect::<Vec<_>>();
        props.extend(settables.iter().map(|s| Property {
            name: s.name.clone(),
            value: String::new(),
            settable: true,
        }));

        Self {
            name: name.to_string(),
            node_type: node_type.to_string(),
            properties: props,
            settables,
            queue,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Every declared property name, settable ones included
    pub fn properties(&self) -> Vec<String> {
        self.properties.iter().map(|p| p.name.clone()).collect()
    }

    pub fn settables(&self) -> &[SettableProperty] {
        &self.settables
    }

    pub fn value(&self, property: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == property)
            .map(|p| p.value.as_str())
    }

    /// Content of `<node>/$properties`: plain properties first, then the
    /// settable ones suffixed `:settable`
    pub fn property_list(&self) -> String {
        self.properties
            .iter()
            .filter(|p| !p.settable)
            .map(|p| p.name.clone())
            .chain(
                self.properties
                    .iter()
                    .filter(|p| p.settable)
                    .map(|p| format!("{}:settable", p.name)),
            )
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Record the value without publishing it; unknown properties are
    /// appended as plain ones
    pub(crate) fn store(&mut self, property: &str, value: &str) {
        log::debug!("node {}: {property} -> {value}", self.name);
        match self.properties.iter_mut().find(|p| p.name == property) {
            Some(p) => p.value = value.to_string(),
            None => self.properties.push(Property {
                name: property.to_string(),
                value: value.to_string(),
                settable: false,
            }),
        }
    }

    /// Store the value and publish it retained. When a settable property is
    /// changed remotely the callback to fire is returned; the caller invokes
    /// it once it no longer holds the device tree.
    pub fn set(
        &mut self,
        property: &str,
        value: &str,
        origin: UpdateOrigin,
    ) -> (Option<OperationId>, Option<SettableCallback>) {
        self.store(property, value);
        let id = self
            .queue
            .publish(format!("{}/{property}", self.name), value)
            .ok();

        let callback = match origin {
            UpdateOrigin::Remote => self
                .settables
                .iter()
                .find(|s| s.name == property)
                .map(|s| s.callback.clone()),
            UpdateOrigin::Local | UpdateOrigin::Restore => None,
        };
        (id, callback)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("properties", &self.properties)
            .field("settables", &self.settables)
            .finish()
    }
}

/// All nodes of the device, keyed by name
#[derive(Debug, Default, Clone)]
pub struct DeviceTree {
    nodes: BTreeMap<String, Node>,
}

impl DeviceTree {
    /// Insert `node` unless one with the same name exists; returns the
    /// node now stored under that name
    pub fn insert(&mut self, node: Node) -> &Node {
        self.nodes.entry(node.name.clone()).or_insert(node)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
