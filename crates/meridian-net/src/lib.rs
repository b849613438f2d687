//! Client networking: connection establishment, the transport loop, the
//! binary message codec, and two-phase protocol routing.

pub mod chunk;
pub mod connect;
pub mod connection;
pub mod keepalive;
pub mod messages;
pub mod parser;
pub mod routing;

pub use chunk::{BulkDecoder, BulkPayload, BufferPool, PoolReleaser, PoolStats};
pub use connect::{ConnectError, ConnectPolicy, RetryPolicy, connect_tcp, connect_with_retry};
pub use connection::{
    Connection, ConnectionConfig, ConnectionHandle, ConnectionState, ConnectionStateWatch,
    DisconnectReason, StatsSnapshot,
};
pub use keepalive::{KeepaliveConfig, KeepaliveSnapshot};
pub use messages::{
    FieldId, FieldTarget, FieldValue, Message, MessageType, ServerId, TreeId, ValueKind,
};
pub use parser::{MessageParser, ParseError, ParserConfig};
pub use routing::{AsyncContext, KeepaliveHandler, ProtocolHandler, ProtocolRouter};
