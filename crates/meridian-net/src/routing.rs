//! Two-phase protocol dispatch.
//!
//! The [`ProtocolRouter`] maps [`MessageType`] values to [`ProtocolHandler`]
//! implementations. Each inbound message gets exactly one
//! [`ProtocolHandler::handle_async`] call on the transport task. A handler
//! that needs simulation state returns the message, which is queued and
//! replayed through [`ProtocolHandler::handle_sync`] on the next
//! [`ProtocolRouter::drain_sync`]. The drain takes the whole queue under the
//! lock before running any handler, so each queued message is delivered at
//! most once.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::connection::ConnectionHandle;
use crate::messages::{Message, MessageType, ServerMessage};

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Context for the async phase: what a handler may touch off the
/// simulation thread.
pub struct AsyncContext<'a> {
    connection: &'a ConnectionHandle,
}

impl<'a> AsyncContext<'a> {
    /// Wrap a connection handle.
    pub fn new(connection: &'a ConnectionHandle) -> Self {
        Self { connection }
    }

    /// Queue a message for the next outbound flush.
    pub fn send(&self, msg: Message) {
        self.connection.send(msg);
    }

    /// Ask the transport loop to close cleanly.
    pub fn request_disconnect(&self) {
        self.connection.request_disconnect();
    }

    /// The underlying connection handle.
    pub fn connection(&self) -> &ConnectionHandle {
        self.connection
    }
}

/// Domain handler for one message type. `S` is the simulation session the
/// sync phase runs against.
pub trait ProtocolHandler<S>: Send + Sync {
    /// Transport-task phase. Must not touch simulation-only state. Return
    /// the message to have it replayed in the sync phase.
    fn handle_async(&self, msg: Message, ctx: &AsyncContext<'_>) -> Option<Message>;

    /// Simulation-thread phase for messages returned by `handle_async`.
    fn handle_sync(&self, msg: Message, session: &mut S);
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes inbound messages to registered handlers by [`MessageType`].
pub struct ProtocolRouter<S> {
    handlers: HashMap<MessageType, Box<dyn ProtocolHandler<S>>>,
    sync_queue: Mutex<Vec<Message>>,
}

impl<S> Default for ProtocolRouter<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ProtocolRouter<S> {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            sync_queue: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler, replacing any previous one for `ty`.
    pub fn register<H: ProtocolHandler<S> + 'static>(&mut self, ty: MessageType, handler: H) {
        self.handlers.insert(ty, Box::new(handler));
    }

    /// Registered message types (useful for startup logging).
    pub fn registered_types(&self) -> impl Iterator<Item = &MessageType> {
        self.handlers.keys()
    }

    /// Run the async phase for one inbound message.
    ///
    /// Returns `false` if no handler is registered and the message was
    /// dropped.
    pub fn dispatch_async(&self, msg: Message, ctx: &AsyncContext<'_>) -> bool {
        let ty = msg.message_type();
        let Some(handler) = self.handlers.get(&ty) else {
            tracing::warn!("No handler registered for {:?}, dropping message", ty);
            return false;
        };
        if let Some(bounced) = handler.handle_async(msg, ctx) {
            self.lock_queue().push(bounced);
        }
        true
    }

    /// Run the sync phase for everything bounced since the last drain.
    /// Returns the number of messages delivered.
    pub fn drain_sync(&self, session: &mut S) -> usize {
        let batch = std::mem::take(&mut *self.lock_queue());
        let count = batch.len();
        for msg in batch {
            match self.handlers.get(&msg.message_type()) {
                Some(handler) => handler.handle_sync(msg, session),
                None => tracing::warn!(
                    "Handler for {:?} vanished before sync phase",
                    msg.message_type()
                ),
            }
        }
        count
    }

    /// Messages waiting for the next sync drain.
    pub fn pending_sync(&self) -> usize {
        self.lock_queue().len()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        self.sync_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Keepalive protocol
// ---------------------------------------------------------------------------

/// Handles [`MessageType::Server`]: answers pings, honours disconnects.
/// Never bounces to the sync phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepaliveHandler;

impl<S> ProtocolHandler<S> for KeepaliveHandler {
    fn handle_async(&self, msg: Message, ctx: &AsyncContext<'_>) -> Option<Message> {
        match msg {
            Message::Server(ServerMessage::Ping) => ctx.send(ServerMessage::Pong.into()),
            Message::Server(ServerMessage::Pong) => {}
            Message::Server(ServerMessage::Disconnect) => {
                tracing::info!("Server requested disconnect");
                ctx.request_disconnect();
            }
            other => tracing::warn!("Keepalive handler got {:?}", other.message_type()),
        }
        None
    }

    fn handle_sync(&self, _msg: Message, _session: &mut S) {}
}
