use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Correlation id of a [`PendingOperation`], traced on submit and on
/// processing
pub type OperationId = Uuid;

/// Receives the raw payload of a remote configuration message
pub type ConfigCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives the full topic and payload of a message on a subscription
pub type TopicCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("operation queue is full, dropping operation {0}")]
    QueueFull(OperationId),
    #[error("operation queue is closed, dropping operation {0}")]
    QueueClosed(OperationId),
}

/// What the session task does with a message arriving on a subscription.
/// Handlers run on the session task, one at a time.
#[derive(Clone)]
pub enum InboundHandler {
    /// `<node>/<property>/set`: update the property, publish it and fire
    /// the settable callback
    SettableCommand { node: String, property: String },
    /// `<node>/<property>`: adopt the retained value once, then unsubscribe
    RestoreRetained { node: String, property: String },
    /// `$implementation/config/set`: hand the payload to every registered
    /// configuration callback
    Config,
    Callback(TopicCallback),
}

impl fmt::Debug for InboundHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SettableCommand { node, property } => {
                write!(f, "SettableCommand({node}/{property})")
            }
            Self::RestoreRetained { node, property } => {
                write!(f, "RestoreRetained({node}/{property})")
            }
            Self::Config => write!(f, "Config"),
            Self::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// A topic operation waiting for the session task. Topics are suffixes
/// relative to the device prefix.
#[derive(Debug)]
pub enum PendingOperation {
    Publish {
        id: OperationId,
        topic: String,
        payload: String,
    },
    Subscribe {
        id: OperationId,
        topic: String,
        handler: InboundHandler,
    },
    Unsubscribe {
        id: OperationId,
        topic: String,
    },
    /// Store a new property value in the device tree, then publish it
    SetProperty {
        id: OperationId,
        node: String,
        property: String,
        value: String,
    },
}

impl PendingOperation {
    pub fn id(&self) -> OperationId {
        match self {
            Self::Publish { id, .. }
            | Self::Subscribe { id, .. }
            | Self::Unsubscribe { id, .. }
            | Self::SetProperty { id, .. } => *id,
        }
    }
}

/// Submitting side of the operation queue. Cheap to clone; submissions
/// never wait, a full queue drops the operation and logs it.
#[derive(Clone, Debug)]
pub struct OperationQueue(mpsc::Sender<PendingOperation>);

impl OperationQueue {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<PendingOperation>) {
        let (sender, receiver) = mpsc::channel(depth);
        (Self(sender), receiver)
    }

    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<OperationId, OperationError> {
        let id = Uuid::new_v4();
        self.submit(PendingOperation::Publish {
            id,
            topic: topic.into(),
            payload: payload.into(),
        })?;
        log::trace!("publication id {id} submitted");
        Ok(id)
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: InboundHandler,
    ) -> Result<OperationId, OperationError> {
        let id = Uuid::new_v4();
        self.submit(PendingOperation::Subscribe {
            id,
            topic: topic.into(),
            handler,
        })?;
        log::trace!("subscription id {id} submitted");
        Ok(id)
    }

    pub fn unsubscribe(&self, topic: impl Into<String>) -> Result<OperationId, OperationError> {
        let id = Uuid::new_v4();
        self.submit(PendingOperation::Unsubscribe {
            id,
            topic: topic.into(),
        })?;
        log::trace!("unsubscription id {id} submitted");
        Ok(id)
    }

    pub fn set_property(
        &self,
        node: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<OperationId, OperationError> {
        let id = Uuid::new_v4();
        self.submit(PendingOperation::SetProperty {
            id,
            node: node.into(),
            property: property.into(),
            value: value.into(),
        })?;
        log::trace!("property update id {id} submitted");
        Ok(id)
    }

    fn submit(&self, op: PendingOperation) -> Result<(), OperationError> {
        let id = op.id();
        self.0.try_send(op).map_err(|e| {
            let err = match e {
                TrySendError::Full(_) => OperationError::QueueFull(id),
                TrySendError::Closed(_) => OperationError::QueueClosed(id),
            };
            log::error!("{err:}");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_are_queued_in_order() {
        let (queue, mut rx) = OperationQueue::new(8);
        let first = queue.publish("$homie", "2.0.0").unwrap();
        let second = queue.subscribe("7/led/set", InboundHandler::Config).unwrap();
        let third = queue.unsubscribe("7/led").unwrap();
        assert_ne!(first, second);

        match rx.try_recv().unwrap() {
            PendingOperation::Publish { id, topic, payload } => {
                assert_eq!(id, first);
                assert_eq!(topic, "$homie");
                assert_eq!(payload, "2.0.0");
            }
            op => panic!("unexpected {op:?}"),
        }
        assert_eq!(rx.try_recv().unwrap().id(), second);
        assert_eq!(rx.try_recv().unwrap().id(), third);
    }

    #[test]
    fn property_update_is_queued_not_applied() {
        let (queue, mut rx) = OperationQueue::new(8);
        let id = queue.set_property("7", "temperature", "21.50").unwrap();

        match rx.try_recv().unwrap() {
            PendingOperation::SetProperty {
                id: queued,
                node,
                property,
                value,
            } => {
                assert_eq!(queued, id);
                assert_eq!((node.as_str(), property.as_str()), ("7", "temperature"));
                assert_eq!(value, "21.50");
            }
            op => panic!("unexpected {op:?}"),
        }
    }

    #[test]
    fn full_queue_drops_the_operation() {
        let (queue, _rx) = OperationQueue::new(1);
        queue.publish("a", "1").unwrap();
        assert!(matches!(
            queue.publish("b", "2"),
            Err(OperationError::QueueFull(_))
        ));
    }

    #[test]
    fn closed_queue_is_reported() {
        let (queue, rx) = OperationQueue::new(1);
        drop(rx);
        assert!(matches!(
            queue.unsubscribe("a"),
            Err(OperationError::QueueClosed(_))
        ));
    }
}
