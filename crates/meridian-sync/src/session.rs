//! The client session: router, synchronization context and connection glue.
//!
//! The transport task runs the router's async phase. The simulation thread
//! calls [`ClientSession::tick`] once per frame, which drains the router's
//! sync phase into the context and then runs one synchronization pass. A
//! hard failure from the pass ends the connection with
//! [`DisconnectReason::Fatal`].

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use meridian_config::{NetworkConfig, SyncConfig};
use meridian_net::{
    ConnectError, ConnectPolicy, Connection, ConnectionConfig, ConnectionHandle, ConnectionState,
    DisconnectReason, KeepaliveHandler, Message, MessageType, ProtocolRouter, connect_tcp,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use crate::context::SynchronizationContext;
use crate::error::SyncError;
use crate::field_table::FieldTable;
use crate::handlers::{ChunkSink, EntityHandler, SynchronizationHandler, TerrainHandler};
use crate::manager::PassReport;
use crate::trees::default_field_table;

/// Client-side state for one server session.
pub struct ClientSession {
    router: Arc<ProtocolRouter<ClientSession>>,
    context: SynchronizationContext,
    connection: Option<ConnectionHandle>,
    chunk_sink: Option<Box<dyn ChunkSink>>,
}

impl ClientSession {
    /// A session with the built-in field table and handlers.
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_field_table(Arc::new(default_field_table()), config)
    }

    pub fn with_field_table(table: Arc<FieldTable>, config: &SyncConfig) -> Self {
        Self::with_router(default_router(), table, config)
    }

    /// A session dispatching through a caller-built router.
    pub fn with_router(
        router: ProtocolRouter<ClientSession>,
        table: Arc<FieldTable>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            router: Arc::new(router),
            context: SynchronizationContext::new(table, config.clone()),
            connection: None,
            chunk_sink: None,
        }
    }

    pub fn router(&self) -> &Arc<ProtocolRouter<ClientSession>> {
        &self.router
    }

    pub fn context(&self) -> &SynchronizationContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut SynchronizationContext {
        &mut self.context
    }

    /// Handle of the current connection, if one is attached.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn set_chunk_sink(&mut self, sink: Box<dyn ChunkSink>) {
        self.chunk_sink = Some(sink);
    }

    pub fn chunk_sink_mut(&mut self) -> Option<&mut dyn ChunkSink> {
        self.chunk_sink
            .as_deref_mut()
            .map(|sink| sink as &mut dyn ChunkSink)
    }

    /// Return a message's pooled buffers to the connection's parser. Without
    /// a connection the buffers are simply freed.
    pub fn release(&self, msg: Message) {
        if let Some(connection) = &self.connection {
            msg.release(connection.releaser());
        }
    }

    /// Start a fresh context for a new connection.
    pub fn on_connect(&mut self, handle: ConnectionHandle) {
        self.context.clear();
        self.connection = Some(handle);
        tracing::info!("Client session connected");
    }

    /// Forget every replica, id mapping and tombstone of the ended
    /// connection.
    pub fn on_disconnect(&mut self) {
        self.context.clear();
        self.connection = None;
        tracing::info!("Client session disconnected");
    }

    /// If the attached connection has ended, clear the session and return
    /// why it ended.
    pub fn poll_disconnect(&mut self) -> Option<DisconnectReason> {
        let ConnectionState::Disconnected(reason) = self.connection.as_ref()?.state().current()
        else {
            return None;
        };
        tracing::info!(%reason, "Connection ended");
        self.on_disconnect();
        Some(reason)
    }

    /// Run the sync phase for everything the transport bounced, then one
    /// synchronization pass.
    pub fn tick(&mut self) -> Result<PassReport, SyncError> {
        let router = Arc::clone(&self.router);
        let delivered = router.drain_sync(self);
        if delivered > 0 {
            tracing::trace!(delivered, "Sync phase drained");
        }

        self.context.process().inspect_err(|err| {
            if let Some(connection) = &self.connection {
                connection.report_fatal(err.to_string());
            }
        })
    }

    /// Run a transport loop over `stream` on a new task and attach it to
    /// this session.
    pub fn attach<T>(
        &mut self,
        stream: T,
        config: ConnectionConfig,
        keep_running: Arc<AtomicBool>,
    ) -> JoinHandle<DisconnectReason>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::new(stream, Arc::clone(&self.router), config, keep_running);
        self.on_connect(connection.handle());
        connection.spawn()
    }

    /// Connect to the configured server and attach the connection.
    pub async fn connect(
        &mut self,
        config: &NetworkConfig,
        keep_running: Arc<AtomicBool>,
    ) -> Result<JoinHandle<DisconnectReason>, ConnectError> {
        let stream = connect_tcp(
            &config.server_address,
            config.server_port,
            ConnectPolicy::from(config),
            &keep_running,
        )
        .await?;
        tracing::info!(
            address = %config.server_address,
            port = config.server_port,
            "Connected to server"
        );
        Ok(self.attach(stream, ConnectionConfig::from(config), keep_running))
    }
}

/// Router with the keepalive, entity, synchronization and terrain handlers.
pub fn default_router() -> ProtocolRouter<ClientSession> {
    let mut router = ProtocolRouter::new();
    router.register(MessageType::Server, KeepaliveHandler);
    router.register(MessageType::Entity, EntityHandler);
    router.register(MessageType::Synchronization, SynchronizationHandler);
    router.register(MessageType::Terrain, TerrainHandler);
    router
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
