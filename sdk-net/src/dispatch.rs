//! Inbound frame routing.
//!
//! A frame whose sequence id has a pending request is always a response,
//! whatever its type. Everything else goes to the [`MessageHandler`]
//! registered for its [`MessageType`], or is dropped.

use {
    crate::{
        correlator::ResponseCorrelator,
        endpoint::PeerEndpoint,
        frame::{Frame, MessageType},
    },
    dashmap::DashMap,
    log::debug,
    std::sync::Arc,
};

/// Receives unsolicited frames of one message type (block and event
/// notifications, pushed transaction receipts).
///
/// Called on an I/O thread; implementations hand work off instead of
/// blocking.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, endpoint: &PeerEndpoint, frame: Frame);
}

impl<F> MessageHandler for F
where
    F: Fn(&PeerEndpoint, Frame) + Send + Sync,
{
    fn on_message(&self, endpoint: &PeerEndpoint, frame: Frame) {
        self(endpoint, frame)
    }
}

pub struct Dispatcher {
    correlator: ResponseCorrelator,
    handlers: DashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new(correlator: ResponseCorrelator) -> Self {
        Self {
            correlator,
            handlers: DashMap::new(),
        }
    }

    /// Install `handler` for `message_type`, returning the one it replaces.
    pub fn register_handler(
        &self,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.insert(message_type, handler)
    }

    pub fn remove_handler(&self, message_type: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.remove(&message_type).map(|(_, handler)| handler)
    }

    /// Route one inbound frame from `endpoint`.
    pub fn dispatch(&self, endpoint: &PeerEndpoint, frame: Frame) {
        let Some(frame) = self.correlator.resolve(frame) else {
            return;
        };
        let handler = self
            .handlers
            .get(&frame.message_type)
            .map(|entry| Arc::clone(entry.value()));
        match handler {
            Some(handler) => handler.on_message(endpoint, frame),
            None => debug!(
                "dropping unhandled {:?} frame {} from {}",
                frame.message_type, frame.seq, endpoint
            ),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
