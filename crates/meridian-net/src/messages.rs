//! Wire message catalogue.
//!
//! Every message starts with a one-byte [`MessageType`] and a one-byte
//! subtype. The variants here are the decoded, strongly typed form; all
//! dynamic typing of payload values is resolved at parse time into
//! [`FieldValue`].

use crate::chunk::{BulkPayload, PoolReleaser};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Server-assigned entity identifier (`i32` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub i32);

/// Behavior-tree identifier (`i32` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeId(pub i32);

/// Synchronized field identifier within a behavior tree (`i32` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub i32);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Top-level message category, the first byte of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Entity lifecycle.
    Entity,
    /// Lore/content queries.
    Lore,
    /// Player bookkeeping.
    Player,
    /// Terrain and block chunk streaming.
    Terrain,
    /// Keepalive and disconnect.
    Server,
    /// Authentication.
    Auth,
    /// Character selection.
    Character,
    /// Inventory.
    Inventory,
    /// Behavior-tree state synchronization.
    Synchronization,
    /// Combat events.
    Combat,
}

impl MessageType {
    /// Decode the leading type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::Entity,
            2 => Self::Lore,
            3 => Self::Player,
            4 => Self::Terrain,
            5 => Self::Server,
            6 => Self::Auth,
            7 => Self::Character,
            8 => Self::Inventory,
            9 => Self::Synchronization,
            10 => Self::Combat,
            _ => return None,
        })
    }

    /// The wire byte for this type.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Entity => 1,
            Self::Lore => 2,
            Self::Player => 3,
            Self::Terrain => 4,
            Self::Server => 5,
            Self::Auth => 6,
            Self::Character => 7,
            Self::Inventory => 8,
            Self::Synchronization => 9,
            Self::Combat => 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// The primitive kind a synchronized field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Enum state carried as a short.
    EnumShort,
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// UTF-8 string.
    Str,
}

/// A decoded field value, tagged with its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    EnumShort(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
}

impl FieldValue {
    /// The kind tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::EnumShort(_) => ValueKind::EnumShort,
            Self::Int(_) => ValueKind::Int,
            Self::Long(_) => ValueKind::Long,
            Self::Float(_) => ValueKind::Float,
            Self::Double(_) => ValueKind::Double,
            Self::Str(_) => ValueKind::Str,
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Keepalive and connection control. None of these carry fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessage {
    Ping,
    Pong,
    Disconnect,
}

impl ServerMessage {
    pub(crate) const PING: u8 = 0;
    pub(crate) const PONG: u8 = 1;
    pub(crate) const DISCONNECT: u8 = 2;

    pub(crate) fn subtype(self) -> u8 {
        match self {
            Self::Ping => Self::PING,
            Self::Pong => Self::PONG,
            Self::Disconnect => Self::DISCONNECT,
        }
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// The server created an entity the client should replicate.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateEntity {
    pub entity_id: ServerId,
    pub category: i32,
    pub subtype: String,
    pub creature_template: String,
    pub position: [f64; 3],
    pub rotation: [f64; 4],
}

/// Entity lifecycle messages.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityMessage {
    Create(CreateEntity),
    Destroy { entity_id: ServerId },
}

impl EntityMessage {
    pub(crate) const CREATE: u8 = 0;
    pub(crate) const DESTROY: u8 = 5;

    /// Target entity of this message.
    pub fn entity_id(&self) -> ServerId {
        match self {
            Self::Create(create) => create.entity_id,
            Self::Destroy { entity_id } => *entity_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// Addresses one synchronized field on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldTarget {
    pub entity_id: ServerId,
    pub tree_id: TreeId,
    pub field_id: FieldId,
}

/// Behavior-tree synchronization messages.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Plain field write. The subtype on the wire follows the value kind.
    UpdateState { target: FieldTarget, value: FieldValue },
    /// Validated state-machine transition.
    Transition { target: FieldTarget, state: i16 },
    /// Client asks the server to act on a tree. Outbound only.
    RequestAction {
        entity_id: ServerId,
        tree_id: TreeId,
        value: i32,
    },
    AttachTree { entity_id: ServerId, tree_id: TreeId },
    DetachTree { entity_id: ServerId, tree_id: TreeId },
    LoadScene { path: String },
}

impl SyncMessage {
    pub(crate) const UPDATE_STATE: u8 = 0;
    pub(crate) const UPDATE_STRING: u8 = 1;
    pub(crate) const UPDATE_INT: u8 = 2;
    pub(crate) const UPDATE_LONG: u8 = 3;
    pub(crate) const UPDATE_FLOAT: u8 = 4;
    pub(crate) const UPDATE_DOUBLE: u8 = 5;
    pub(crate) const REQUEST_ACTION: u8 = 6;
    pub(crate) const TRANSITION: u8 = 7;
    pub(crate) const ATTACH_TREE: u8 = 8;
    pub(crate) const DETACH_TREE: u8 = 9;
    pub(crate) const LOAD_SCENE: u8 = 10;

    /// Entity this message targets. `LoadScene` has none.
    pub fn entity_id(&self) -> Option<ServerId> {
        match self {
            Self::UpdateState { target, .. } | Self::Transition { target, .. } => {
                Some(target.entity_id)
            }
            Self::RequestAction { entity_id, .. }
            | Self::AttachTree { entity_id, .. }
            | Self::DetachTree { entity_id, .. } => Some(*entity_id),
            Self::LoadScene { .. } => None,
        }
    }

    /// Field addressed by this message, for field writes and transitions.
    pub fn target(&self) -> Option<FieldTarget> {
        match self {
            Self::UpdateState { target, .. } | Self::Transition { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Short human-readable name, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::UpdateState { value, .. } => match value.kind() {
                ValueKind::EnumShort => "UpdateClientState",
                ValueKind::Int => "UpdateClientIntState",
                ValueKind::Long => "UpdateClientLongState",
                ValueKind::Float => "UpdateClientFloatState",
                ValueKind::Double => "UpdateClientDoubleState",
                ValueKind::Str => "UpdateClientStringState",
            },
            Self::Transition { .. } => "ServerNotifyBTreeTransition",
            Self::RequestAction { .. } => "ClientRequestBTreeAction",
            Self::AttachTree { .. } => "AttachTree",
            Self::DetachTree { .. } => "DetachTree",
            Self::LoadScene { .. } => "LoadScene",
        }
    }

    pub(crate) fn subtype(&self) -> u8 {
        match self {
            Self::UpdateState { value, .. } => match value.kind() {
                ValueKind::EnumShort => Self::UPDATE_STATE,
                ValueKind::Str => Self::UPDATE_STRING,
                ValueKind::Int => Self::UPDATE_INT,
                ValueKind::Long => Self::UPDATE_LONG,
                ValueKind::Float => Self::UPDATE_FLOAT,
                ValueKind::Double => Self::UPDATE_DOUBLE,
            },
            Self::RequestAction { .. } => Self::REQUEST_ACTION,
            Self::Transition { .. } => Self::TRANSITION,
            Self::AttachTree { .. } => Self::ATTACH_TREE,
            Self::DetachTree { .. } => Self::DETACH_TREE,
            Self::LoadScene { .. } => Self::LOAD_SCENE,
        }
    }
}

// ---------------------------------------------------------------------------
// Terrain
// ---------------------------------------------------------------------------

/// Marker value meaning "a full array follows".
pub const NOT_HOMOGENEOUS: i32 = -1;

/// Request for a reduced-resolution chunk at a world position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    pub world_x: i32,
    pub world_y: i32,
    pub world_z: i32,
    pub resolution: i32,
}

/// Fixed fields preceding a bulk chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub world_x: i32,
    pub world_y: i32,
    pub world_z: i32,
    pub resolution: i32,
    /// [`NOT_HOMOGENEOUS`] or the single value filling the whole chunk.
    pub homogeneous: i32,
}

impl ChunkHeader {
    /// Whether the chunk is a single repeated value.
    pub fn is_homogeneous(&self) -> bool {
        self.homogeneous != NOT_HOMOGENEOUS
    }
}

/// A chunk with its decoded payload.
#[derive(Debug, PartialEq)]
pub struct ChunkData {
    pub header: ChunkHeader,
    pub payload: BulkPayload,
}

/// Terrain streaming messages.
#[derive(Debug, PartialEq)]
pub enum TerrainMessage {
    RequestReducedChunk(ChunkRequest),
    ReducedChunk(ChunkData),
    RequestReducedBlock(ChunkRequest),
    ReducedBlock(ChunkData),
}

impl TerrainMessage {
    pub const REQUEST_REDUCED_CHUNK: u8 = 9;
    pub const SEND_REDUCED_CHUNK: u8 = 10;
    pub const REQUEST_REDUCED_BLOCK: u8 = 11;
    pub const SEND_REDUCED_BLOCK: u8 = 12;

    pub(crate) fn subtype(&self) -> u8 {
        match self {
            Self::RequestReducedChunk(_) => Self::REQUEST_REDUCED_CHUNK,
            Self::ReducedChunk(_) => Self::SEND_REDUCED_CHUNK,
            Self::RequestReducedBlock(_) => Self::REQUEST_REDUCED_BLOCK,
            Self::ReducedBlock(_) => Self::SEND_REDUCED_BLOCK,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A fully parsed message.
#[derive(Debug, PartialEq)]
pub enum Message {
    Server(ServerMessage),
    Entity(EntityMessage),
    Sync(SyncMessage),
    Terrain(TerrainMessage),
}

impl Message {
    /// Routing key for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Server(_) => MessageType::Server,
            Self::Entity(_) => MessageType::Entity,
            Self::Sync(_) => MessageType::Synchronization,
            Self::Terrain(_) => MessageType::Terrain,
        }
    }

    /// Wire subtype byte.
    pub fn subtype(&self) -> u8 {
        match self {
            Self::Server(m) => m.subtype(),
            Self::Entity(EntityMessage::Create(_)) => EntityMessage::CREATE,
            Self::Entity(EntityMessage::Destroy { .. }) => EntityMessage::DESTROY,
            Self::Sync(m) => m.subtype(),
            Self::Terrain(m) => m.subtype(),
        }
    }

    /// Hand any pooled buffers back to the parser's pool. Messages without
    /// bulk data are simply dropped.
    pub fn release(self, releaser: &PoolReleaser) {
        if let Self::Terrain(
            TerrainMessage::ReducedChunk(chunk) | TerrainMessage::ReducedBlock(chunk),
        ) = self
        {
            chunk.payload.release(releaser);
        }
    }
}

impl From<SyncMessage> for Message {
    fn from(msg: SyncMessage) -> Self {
        Self::Sync(msg)
    }
}

impl From<EntityMessage> for Message {
    fn from(msg: EntityMessage) -> Self {
        Self::Entity(msg)
    }
}

impl From<ServerMessage> for Message {
    fn from(msg: ServerMessage) -> Self {
        Self::Server(msg)
    }
}

impl From<TerrainMessage> for Message {
    fn from(msg: TerrainMessage) -> Self {
        Self::Terrain(msg)
    }
}
