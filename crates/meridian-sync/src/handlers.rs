//! Client protocol handlers for [`ClientSession`].
//!
//! None of these touch the replica world on the transport task: every
//! message that changes simulation state is bounced to the sync phase.

use meridian_net::messages::{ChunkData, EntityMessage, Message, TerrainMessage};
use meridian_net::{AsyncContext, ProtocolHandler};

use crate::session::ClientSession;

/// Receives reduced terrain and block chunks on the simulation thread.
///
/// The chunk is borrowed; its buffers go back to the parser's pool as soon
/// as the call returns.
pub trait ChunkSink: Send {
    fn reduced_chunk(&mut self, chunk: &ChunkData);

    fn reduced_block(&mut self, chunk: &ChunkData);
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// Queues behavior-tree messages on the synchronization manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynchronizationHandler;

impl ProtocolHandler<ClientSession> for SynchronizationHandler {
    fn handle_async(&self, msg: Message, _ctx: &AsyncContext<'_>) -> Option<Message> {
        Some(msg)
    }

    fn handle_sync(&self, msg: Message, session: &mut ClientSession) {
        match msg {
            Message::Sync(sync) => {
                session.context().sync.push_message(sync);
            }
            other => tracing::warn!(
                "Synchronization handler got {:?}",
                other.message_type()
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Entity lifecycle
// ---------------------------------------------------------------------------

/// Spawns and despawns replicas, maintaining ids and tombstones.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntityHandler;

impl ProtocolHandler<ClientSession> for EntityHandler {
    fn handle_async(&self, msg: Message, _ctx: &AsyncContext<'_>) -> Option<Message> {
        Some(msg)
    }

    fn handle_sync(&self, msg: Message, session: &mut ClientSession) {
        let ctx = session.context_mut();
        match msg {
            Message::Entity(EntityMessage::Create(create)) => {
                if ctx.sync.eject_tombstone(create.entity_id) {
                    tracing::debug!(id = %create.entity_id, "Server re-created destroyed entity");
                }
                let entity = ctx.replica.spawn_replica(&create);
                tracing::trace!(id = %create.entity_id, ?entity, "Replica spawned");
            }
            Message::Entity(EntityMessage::Destroy { entity_id }) => {
                if ctx.sync.is_tombstoned(entity_id) {
                    tracing::debug!(id = %entity_id, "Duplicate destroy for tombstoned entity");
                    return;
                }
                if !ctx.replica.despawn_replica(entity_id) {
                    tracing::debug!(id = %entity_id, "Destroy for unregistered entity");
                }
                ctx.sync.add_tombstone(entity_id);
            }
            other => tracing::warn!("Entity handler got {:?}", other.message_type()),
        }
    }
}

// ---------------------------------------------------------------------------
// Terrain
// ---------------------------------------------------------------------------

/// Forwards reduced chunks to the session's [`ChunkSink`] and returns their
/// buffers to the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerrainHandler;

impl ProtocolHandler<ClientSession> for TerrainHandler {
    fn handle_async(&self, msg: Message, _ctx: &AsyncContext<'_>) -> Option<Message> {
        match msg {
            Message::Terrain(TerrainMessage::ReducedChunk(_) | TerrainMessage::ReducedBlock(_)) => {
                Some(msg)
            }
            Message::Terrain(TerrainMessage::RequestReducedChunk(req))
            | Message::Terrain(TerrainMessage::RequestReducedBlock(req)) => {
                tracing::warn!(?req, "Server sent a client-bound chunk request");
                None
            }
            other => {
                tracing::warn!("Terrain handler got {:?}", other.message_type());
                None
            }
        }
    }

    fn handle_sync(&self, msg: Message, session: &mut ClientSession) {
        if let Some(sink) = session.chunk_sink_mut() {
            match &msg {
                Message::Terrain(TerrainMessage::ReducedChunk(chunk)) => sink.reduced_chunk(chunk),
                Message::Terrain(TerrainMessage::ReducedBlock(chunk)) => sink.reduced_block(chunk),
                _ => {}
            }
        }
        session.release(msg);
    }
}
