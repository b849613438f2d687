//! Byte stream to message framing.
//!
//! Every message on the wire has the same envelope:
//!
//! ```text
//! +---------+---------+-----------------------------+---------------------------+
//! | type u8 | sub u8  | i32 length per var field    | fields in declared order  |
//! +---------+---------+-----------------------------+---------------------------+
//! ```
//!
//! All multi-byte scalars are big-endian. Variable-length fields (strings,
//! bulk payloads) appear inline with the length given in the table. There is
//! no overall length prefix, so a message can only be skipped by decoding it;
//! an unknown type or subtype poisons the stream.
//!
//! [`MessageParser::feed`] appends bytes as they arrive and
//! [`MessageParser::next_message`] yields complete messages, leaving a
//! partial tail buffered until the rest shows up.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};

use crate::chunk::{
    BufferPool, BulkDecoder, PoolReleaser, PoolStats, decode_block_chunk, decode_voxel_chunk,
};
use crate::messages::{
    ChunkData, ChunkHeader, ChunkRequest, CreateEntity, EntityMessage, FieldId, FieldTarget,
    FieldValue, Message, MessageType, ServerId, ServerMessage, SyncMessage, TerrainMessage,
    TreeId,
};

/// Configuration for the parser.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Largest accepted variable-length field in bytes. Default: 16 MiB.
    pub max_field_len: u32,
    /// Buffers retained per element type by the chunk pool. Default: 1000.
    pub pool_capacity: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_field_len: 16 * 1024 * 1024,
            pool_capacity: crate::chunk::DEFAULT_POOL_CAPACITY,
        }
    }
}

/// Errors that make the inbound stream undecodable.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The leading byte is not a known message type.
    #[error("unknown message type byte {0}")]
    UnknownType(u8),

    /// The type is known but this client cannot decode the subtype.
    #[error("unknown subtype {subtype} for {ty:?}")]
    UnknownSubtype {
        /// Message type.
        ty: MessageType,
        /// Offending subtype byte.
        subtype: u8,
    },

    /// A bulk message arrived with no decoder registered for it.
    #[error("no payload decoder registered for {ty:?}/{subtype}")]
    MissingDecoder {
        /// Message type.
        ty: MessageType,
        /// Subtype byte.
        subtype: u8,
    },

    /// A length table entry is negative or over the configured maximum.
    #[error("field length {len} outside 0..={max}")]
    InvalidLength {
        /// Length as read from the wire.
        len: i32,
        /// Configured maximum.
        max: u32,
    },

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// A bulk payload has the wrong size for its declared layout.
    #[error("bulk payload is {actual} bytes, expected {expected}")]
    PayloadSize {
        /// Bytes the layout requires.
        expected: usize,
        /// Bytes actually carried.
        actual: usize,
    },
}

/// Decode outcome for one attempt: either not enough bytes yet, or a real
/// error.
enum Fault {
    Incomplete,
    Invalid(ParseError),
}

impl From<ParseError> for Fault {
    fn from(err: ParseError) -> Self {
        Fault::Invalid(err)
    }
}

type DecoderMap = HashMap<(MessageType, u8), Box<dyn BulkDecoder>>;

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Incremental message parser with pluggable bulk decoders.
pub struct MessageParser {
    inbound: BytesMut,
    decoders: DecoderMap,
    pool: BufferPool,
    max_field_len: u32,
    parsed: u64,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl MessageParser {
    /// Create a parser with the built-in terrain and block chunk decoders.
    pub fn new(config: ParserConfig) -> Self {
        let mut parser = Self::without_decoders(config);
        parser.register_decoder(
            MessageType::Terrain,
            TerrainMessage::SEND_REDUCED_CHUNK,
            decode_voxel_chunk,
        );
        parser.register_decoder(
            MessageType::Terrain,
            TerrainMessage::SEND_REDUCED_BLOCK,
            decode_block_chunk,
        );
        parser
    }

    /// Create a parser with no bulk decoders registered.
    pub fn without_decoders(config: ParserConfig) -> Self {
        Self {
            inbound: BytesMut::with_capacity(8 * 1024),
            decoders: HashMap::new(),
            pool: BufferPool::new(config.pool_capacity),
            max_field_len: config.max_field_len,
            parsed: 0,
        }
    }

    /// Register (or replace) the bulk decoder for a (type, subtype) pair.
    pub fn register_decoder<D: BulkDecoder + 'static>(
        &mut self,
        ty: MessageType,
        subtype: u8,
        decoder: D,
    ) {
        self.decoders.insert((ty, subtype), Box::new(decoder));
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed by a complete message.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Messages parsed over the lifetime of this parser.
    pub fn parsed_count(&self) -> u64 {
        self.parsed
    }

    /// Handle for returning chunk buffers to this parser's pool.
    pub fn releaser(&self) -> PoolReleaser {
        self.pool.releaser()
    }

    /// Chunk pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Decode the next complete message.
    ///
    /// Returns `Ok(None)` without consuming anything when the buffer holds
    /// only part of a message. After an error the buffer is left as is and
    /// the stream should be abandoned.
    pub fn next_message(&mut self) -> Result<Option<Message>, ParseError> {
        let mut reader = WireReader {
            cur: &self.inbound[..],
            max_len: self.max_field_len,
        };
        match decode(&mut reader, &self.decoders, &mut self.pool) {
            Ok(msg) => {
                let consumed = self.inbound.len() - reader.cur.len();
                self.inbound.advance(consumed);
                self.parsed += 1;
                Ok(Some(msg))
            }
            Err(Fault::Incomplete) => Ok(None),
            Err(Fault::Invalid(err)) => Err(err),
        }
    }

    /// Decode every complete message currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Message>, ParseError> {
        let mut out = Vec::new();
        while let Some(msg) = self.next_message()? {
            out.push(msg);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct WireReader<'a> {
    cur: &'a [u8],
    max_len: u32,
}

impl<'a> WireReader<'a> {
    fn need(&self, n: usize) -> Result<(), Fault> {
        if self.cur.remaining() < n {
            Err(Fault::Incomplete)
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, Fault> {
        self.need(1)?;
        Ok(self.cur.get_u8())
    }

    fn i32(&mut self) -> Result<i32, Fault> {
        self.need(4)?;
        Ok(self.cur.get_i32())
    }

    fn i64(&mut self) -> Result<i64, Fault> {
        self.need(8)?;
        Ok(self.cur.get_i64())
    }

    fn f32(&mut self) -> Result<f32, Fault> {
        self.need(4)?;
        Ok(self.cur.get_f32())
    }

    fn f64(&mut self) -> Result<f64, Fault> {
        self.need(8)?;
        Ok(self.cur.get_f64())
    }

    /// A length table entry, validated against the configured maximum.
    fn len(&mut self) -> Result<usize, Fault> {
        let len = self.i32()?;
        if len < 0 || len as u32 > self.max_len {
            return Err(ParseError::InvalidLength {
                len,
                max: self.max_len,
            }
            .into());
        }
        Ok(len as usize)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], Fault> {
        self.need(len)?;
        let cur: &'a [u8] = self.cur;
        let (head, tail) = cur.split_at(len);
        self.cur = tail;
        Ok(head)
    }

    fn string(&mut self, len: usize) -> Result<String, Fault> {
        let raw = self.bytes(len)?;
        Ok(std::str::from_utf8(raw).map_err(ParseError::from)?.to_owned())
    }

    fn target(&mut self) -> Result<FieldTarget, Fault> {
        Ok(FieldTarget {
            entity_id: ServerId(self.i32()?),
            tree_id: TreeId(self.i32()?),
            field_id: FieldId(self.i32()?),
        })
    }

    fn chunk_request(&mut self) -> Result<ChunkRequest, Fault> {
        Ok(ChunkRequest {
            world_x: self.i32()?,
            world_y: self.i32()?,
            world_z: self.i32()?,
            resolution: self.i32()?,
        })
    }
}

fn decode(
    r: &mut WireReader<'_>,
    decoders: &DecoderMap,
    pool: &mut BufferPool,
) -> Result<Message, Fault> {
    let type_byte = r.u8()?;
    let ty = MessageType::from_byte(type_byte).ok_or(ParseError::UnknownType(type_byte))?;
    let subtype = r.u8()?;

    match ty {
        MessageType::Server => {
            let msg = match subtype {
                ServerMessage::PING => ServerMessage::Ping,
                ServerMessage::PONG => ServerMessage::Pong,
                ServerMessage::DISCONNECT => ServerMessage::Disconnect,
                _ => return Err(ParseError::UnknownSubtype { ty, subtype }.into()),
            };
            Ok(Message::Server(msg))
        }
        MessageType::Entity => decode_entity(r, subtype).map(Message::Entity),
        MessageType::Synchronization => decode_sync(r, subtype).map(Message::Sync),
        MessageType::Terrain => {
            decode_terrain(r, ty, subtype, decoders, pool).map(Message::Terrain)
        }
        _ => Err(ParseError::UnknownSubtype { ty, subtype }.into()),
    }
}

fn decode_entity(r: &mut WireReader<'_>, subtype: u8) -> Result<EntityMessage, Fault> {
    match subtype {
        EntityMessage::CREATE => {
            let subtype_len = r.len()?;
            let template_len = r.len()?;
            let entity_id = ServerId(r.i32()?);
            let category = r.i32()?;
            let subtype = r.string(subtype_len)?;
            let creature_template = r.string(template_len)?;
            let position = [r.f64()?, r.f64()?, r.f64()?];
            let rotation = [r.f64()?, r.f64()?, r.f64()?, r.f64()?];
            Ok(EntityMessage::Create(CreateEntity {
                entity_id,
                category,
                subtype,
                creature_template,
                position,
                rotation,
            }))
        }
        EntityMessage::DESTROY => Ok(EntityMessage::Destroy {
            entity_id: ServerId(r.i32()?),
        }),
        _ => Err(ParseError::UnknownSubtype {
            ty: MessageType::Entity,
            subtype,
        }
        .into()),
    }
}

fn decode_sync(r: &mut WireReader<'_>, subtype: u8) -> Result<SyncMessage, Fault> {
    let msg = match subtype {
        SyncMessage::UPDATE_STRING => {
            let len = r.len()?;
            let target = r.target()?;
            let value = FieldValue::Str(r.string(len)?);
            SyncMessage::UpdateState { target, value }
        }
        SyncMessage::UPDATE_STATE
        | SyncMessage::UPDATE_INT
        | SyncMessage::UPDATE_LONG
        | SyncMessage::UPDATE_FLOAT
        | SyncMessage::UPDATE_DOUBLE => {
            let target = r.target()?;
            let value = match subtype {
                SyncMessage::UPDATE_STATE => FieldValue::EnumShort(r.i32()? as i16),
                SyncMessage::UPDATE_INT => FieldValue::Int(r.i32()?),
                SyncMessage::UPDATE_LONG => FieldValue::Long(r.i64()?),
                SyncMessage::UPDATE_FLOAT => FieldValue::Float(r.f32()?),
                _ => FieldValue::Double(r.f64()?),
            };
            SyncMessage::UpdateState { target, value }
        }
        SyncMessage::REQUEST_ACTION => SyncMessage::RequestAction {
            entity_id: ServerId(r.i32()?),
            tree_id: TreeId(r.i32()?),
            value: r.i32()?,
        },
        SyncMessage::TRANSITION => {
            let target = r.target()?;
            let state = r.i32()? as i16;
            SyncMessage::Transition { target, state }
        }
        SyncMessage::ATTACH_TREE => SyncMessage::AttachTree {
            entity_id: ServerId(r.i32()?),
            tree_id: TreeId(r.i32()?),
        },
        SyncMessage::DETACH_TREE => SyncMessage::DetachTree {
            entity_id: ServerId(r.i32()?),
            tree_id: TreeId(r.i32()?),
        },
        SyncMessage::LOAD_SCENE => {
            let len = r.len()?;
            SyncMessage::LoadScene {
                path: r.string(len)?,
            }
        }
        _ => {
            return Err(ParseError::UnknownSubtype {
                ty: MessageType::Synchronization,
                subtype,
            }
            .into());
        }
    };
    Ok(msg)
}

fn decode_terrain(
    r: &mut WireReader<'_>,
    ty: MessageType,
    subtype: u8,
    decoders: &DecoderMap,
    pool: &mut BufferPool,
) -> Result<TerrainMessage, Fault> {
    match subtype {
        TerrainMessage::REQUEST_REDUCED_CHUNK => {
            Ok(TerrainMessage::RequestReducedChunk(r.chunk_request()?))
        }
        TerrainMessage::REQUEST_REDUCED_BLOCK => {
            Ok(TerrainMessage::RequestReducedBlock(r.chunk_request()?))
        }
        TerrainMessage::SEND_REDUCED_CHUNK | TerrainMessage::SEND_REDUCED_BLOCK => {
            let payload_len = r.len()?;
            let header = ChunkHeader {
                world_x: r.i32()?,
                world_y: r.i32()?,
                world_z: r.i32()?,
                resolution: r.i32()?,
                homogeneous: r.i32()?,
            };
            let raw = r.bytes(payload_len)?;
            // Only decode once the whole message is buffered.
            let decoder = decoders
                .get(&(ty, subtype))
                .ok_or(ParseError::MissingDecoder { ty, subtype })?;
            let payload = decoder.decode(&header, raw, pool)?;
            let chunk = ChunkData { header, payload };
            Ok(if subtype == TerrainMessage::SEND_REDUCED_CHUNK {
                TerrainMessage::ReducedChunk(chunk)
            } else {
                TerrainMessage::ReducedBlock(chunk)
            })
        }
        _ => Err(ParseError::UnknownSubtype { ty, subtype }.into()),
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_str_len(out: &mut BytesMut, s: &str) {
    out.put_i32(s.len() as i32);
}

fn put_target(out: &mut BytesMut, target: &FieldTarget) {
    out.put_i32(target.entity_id.0);
    out.put_i32(target.tree_id.0);
    out.put_i32(target.field_id.0);
}

fn put_request(out: &mut BytesMut, req: &ChunkRequest) {
    out.put_i32(req.world_x);
    out.put_i32(req.world_y);
    out.put_i32(req.world_z);
    out.put_i32(req.resolution);
}

/// Append the wire form of `msg` to `out`.
pub fn encode(msg: &Message, out: &mut BytesMut) {
    out.put_u8(msg.message_type().as_byte());
    out.put_u8(msg.subtype());

    match msg {
        Message::Server(_) => {}
        Message::Entity(EntityMessage::Create(create)) => {
            put_str_len(out, &create.subtype);
            put_str_len(out, &create.creature_template);
            out.put_i32(create.entity_id.0);
            out.put_i32(create.category);
            out.put_slice(create.subtype.as_bytes());
            out.put_slice(create.creature_template.as_bytes());
            create.position.iter().for_each(|v| out.put_f64(*v));
            create.rotation.iter().for_each(|v| out.put_f64(*v));
        }
        Message::Entity(EntityMessage::Destroy { entity_id }) => out.put_i32(entity_id.0),
        Message::Sync(sync) => match sync {
            SyncMessage::UpdateState { target, value } => {
                // Strings are the only variable field, so the length table
                // comes before the target.
                if let FieldValue::Str(s) = value {
                    put_str_len(out, s);
                }
                put_target(out, target);
                match value {
                    FieldValue::EnumShort(v) => out.put_i32(i32::from(*v)),
                    FieldValue::Int(v) => out.put_i32(*v),
                    FieldValue::Long(v) => out.put_i64(*v),
                    FieldValue::Float(v) => out.put_f32(*v),
                    FieldValue::Double(v) => out.put_f64(*v),
                    FieldValue::Str(s) => out.put_slice(s.as_bytes()),
                }
            }
            SyncMessage::Transition { target, state } => {
                put_target(out, target);
                out.put_i32(i32::from(*state));
            }
            SyncMessage::RequestAction {
                entity_id,
                tree_id,
                value,
            } => {
                out.put_i32(entity_id.0);
                out.put_i32(tree_id.0);
                out.put_i32(*value);
            }
            SyncMessage::AttachTree { entity_id, tree_id }
            | SyncMessage::DetachTree { entity_id, tree_id } => {
                out.put_i32(entity_id.0);
                out.put_i32(tree_id.0);
            }
            SyncMessage::LoadScene { path } => {
                put_str_len(out, path);
                out.put_slice(path.as_bytes());
            }
        },
        Message::Terrain(
            TerrainMessage::RequestReducedChunk(req) | TerrainMessage::RequestReducedBlock(req),
        ) => put_request(out, req),
        Message::Terrain(
            TerrainMessage::ReducedChunk(chunk) | TerrainMessage::ReducedBlock(chunk),
        ) => {
            out.put_i32(chunk.payload.encoded_len() as i32);
            let h = &chunk.header;
            out.put_i32(h.world_x);
            out.put_i32(h.world_y);
            out.put_i32(h.world_z);
            out.put_i32(h.resolution);
            out.put_i32(h.homogeneous);
            chunk.payload.encode_into(out);
        }
    }
}

/// Encode a single message into a fresh buffer.
pub fn to_bytes(msg: &Message) -> BytesMut {
    let mut out = BytesMut::new();
    encode(msg, &mut out);
    out
}

#[cfg(test)]
#[path = "parser_tests.rs"]
mod tests;
