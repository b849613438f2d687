//! Unit tests for the message parser.

use super::*;
use crate::chunk::{BulkPayload, VOXEL_COUNT, VoxelChunk};
use crate::messages::NOT_HOMOGENEOUS;

fn target(entity: i32, tree: i32, field: i32) -> FieldTarget {
    FieldTarget {
        entity_id: ServerId(entity),
        tree_id: TreeId(tree),
        field_id: FieldId(field),
    }
}

fn int_update(entity: i32, value: i32) -> Message {
    Message::Sync(SyncMessage::UpdateState {
        target: target(entity, 5, 2),
        value: FieldValue::Int(value),
    })
}

fn voxel_message(homogeneous: i32, payload: BulkPayload) -> Message {
    Message::Terrain(TerrainMessage::ReducedChunk(ChunkData {
        header: ChunkHeader {
            world_x: 4,
            world_y: -1,
            world_z: 7,
            resolution: 2,
            homogeneous,
        },
        payload,
    }))
}

#[test]
fn test_int_update_wire_layout_is_big_endian() {
    let bytes = to_bytes(&int_update(42, 7));
    assert_eq!(
        &bytes[..],
        &[
            9, 2, // type, subtype
            0, 0, 0, 42, // entity
            0, 0, 0, 5, // tree
            0, 0, 0, 2, // field
            0, 0, 0, 7, // value
        ]
    );
}

#[test]
fn test_string_update_length_table_comes_first() {
    let msg = Message::Sync(SyncMessage::UpdateState {
        target: target(1, 0, 3),
        value: FieldValue::Str("jab".into()),
    });
    let bytes = to_bytes(&msg);
    assert_eq!(&bytes[..2], &[9, 1]);
    assert_eq!(&bytes[2..6], &3i32.to_be_bytes());
    assert_eq!(&bytes[6..10], &1i32.to_be_bytes());
    assert_eq!(&bytes[bytes.len() - 3..], b"jab");

    let mut parser = MessageParser::default();
    parser.feed(&bytes);
    assert_eq!(parser.next_message().unwrap(), Some(msg));
}

#[test]
fn test_partial_message_buffered_across_feeds() {
    let msg = Message::Entity(EntityMessage::Create(CreateEntity {
        entity_id: ServerId(12),
        category: 0,
        subtype: "human".into(),
        creature_template: "knight".into(),
        position: [1.0, 2.0, 3.0],
        rotation: [0.0, 0.0, 0.0, 1.0],
    }));
    let bytes = to_bytes(&msg);
    let mut parser = MessageParser::default();

    for (i, byte) in bytes.iter().enumerate() {
        parser.feed(&[*byte]);
        let parsed = parser.next_message().unwrap();
        if i + 1 < bytes.len() {
            assert!(parsed.is_none(), "complete too early at byte {i}");
            assert_eq!(parser.buffered(), i + 1, "partial input must not be consumed");
        } else {
            assert_eq!(parsed.as_ref(), Some(&msg));
        }
    }
    assert_eq!(parser.buffered(), 0);
}

#[test]
fn test_multiple_messages_in_one_feed() {
    let mut bytes = to_bytes(&int_update(1, 10));
    encode(&Message::Server(ServerMessage::Ping), &mut bytes);
    encode(&int_update(2, 20), &mut bytes);
    // Trailing half message.
    let tail = to_bytes(&int_update(3, 30));
    bytes.extend_from_slice(&tail[..5]);

    let mut parser = MessageParser::default();
    parser.feed(&bytes);
    let parsed = parser.drain().unwrap();
    assert_eq!(
        parsed,
        vec![
            int_update(1, 10),
            Message::Server(ServerMessage::Ping),
            int_update(2, 20),
        ]
    );
    assert_eq!(parser.buffered(), 5);
    assert_eq!(parser.parsed_count(), 3);

    parser.feed(&tail[5..]);
    assert_eq!(parser.next_message().unwrap(), Some(int_update(3, 30)));
}

#[test]
fn test_enum_state_carried_as_int() {
    let msg = Message::Sync(SyncMessage::UpdateState {
        target: target(1, 2, 3),
        value: FieldValue::EnumShort(-2),
    });
    let bytes = to_bytes(&msg);
    assert_eq!(&bytes[14..], &(-2i32).to_be_bytes());

    let mut parser = MessageParser::default();
    parser.feed(&bytes);
    assert_eq!(parser.next_message().unwrap(), Some(msg));
}

#[test]
fn test_unknown_type_is_error() {
    let mut parser = MessageParser::default();
    parser.feed(&[0xEE, 0]);
    assert!(matches!(
        parser.next_message(),
        Err(ParseError::UnknownType(0xEE))
    ));
}

#[test]
fn test_unknown_subtype_is_error() {
    let mut parser = MessageParser::default();
    parser.feed(&[MessageType::Synchronization.as_byte(), 99]);
    assert!(matches!(
        parser.next_message(),
        Err(ParseError::UnknownSubtype {
            ty: MessageType::Synchronization,
            subtype: 99
        })
    ));
}

#[test]
fn test_type_outside_client_catalogue_is_error() {
    let mut parser = MessageParser::default();
    parser.feed(&[MessageType::Inventory.as_byte(), 0]);
    assert!(matches!(
        parser.next_message(),
        Err(ParseError::UnknownSubtype {
            ty: MessageType::Inventory,
            ..
        })
    ));
}

#[test]
fn test_negative_length_is_rejected() {
    let mut parser = MessageParser::default();
    let mut bytes = BytesMut::new();
    bytes.put_u8(MessageType::Synchronization.as_byte());
    bytes.put_u8(SyncMessage::LOAD_SCENE);
    bytes.put_i32(-4);
    parser.feed(&bytes);
    assert!(matches!(
        parser.next_message(),
        Err(ParseError::InvalidLength { len: -4, .. })
    ));
}

#[test]
fn test_oversized_length_is_rejected() {
    let mut parser = MessageParser::new(ParserConfig {
        max_field_len: 8,
        ..ParserConfig::default()
    });
    let bytes = to_bytes(&Message::Sync(SyncMessage::LoadScene {
        path: "a/very/long/scene/path.json".into(),
    }));
    parser.feed(&bytes);
    assert!(matches!(
        parser.next_message(),
        Err(ParseError::InvalidLength { max: 8, .. })
    ));
}

#[test]
fn test_invalid_utf8_is_error() {
    let mut bytes = BytesMut::new();
    bytes.put_u8(MessageType::Synchronization.as_byte());
    bytes.put_u8(SyncMessage::LOAD_SCENE);
    bytes.put_i32(2);
    bytes.put_slice(&[0xC3, 0x28]);
    let mut parser = MessageParser::default();
    parser.feed(&bytes);
    assert!(matches!(
        parser.next_message(),
        Err(ParseError::InvalidUtf8(_))
    ));
}

#[test]
fn test_homogeneous_chunk_short_circuits() {
    let msg = voxel_message(3, BulkPayload::Voxel(VoxelChunk::Homogeneous(3)));
    let bytes = to_bytes(&msg);
    // Fixed header plus the single sentinel byte.
    assert_eq!(bytes.len(), 2 + 4 * 6 + 1);
    assert_eq!(bytes[bytes.len() - 1], 0xFF);

    let mut parser = MessageParser::default();
    parser.feed(&bytes);
    assert_eq!(parser.next_message().unwrap(), Some(msg));
    assert_eq!(parser.pool_stats().allocated, 0);
}

#[test]
fn test_full_chunk_decodes_through_pool() {
    let weights: Vec<f32> = (0..VOXEL_COUNT).map(|i| i as f32).collect();
    let types: Vec<i32> = (0..VOXEL_COUNT).map(|i| (i % 3) as i32).collect();
    let msg = voxel_message(
        NOT_HOMOGENEOUS,
        BulkPayload::Voxel(VoxelChunk::Full { weights, types }),
    );
    let bytes = to_bytes(&msg);

    let mut parser = MessageParser::default();
    let releaser = parser.releaser();
    parser.feed(&bytes);
    let parsed = parser.next_message().unwrap().unwrap();
    assert_eq!(parsed, msg);

    parsed.release(&releaser);
    parser.feed(&bytes);
    assert!(parser.next_message().unwrap().is_some());
    let stats = parser.pool_stats();
    assert_eq!(stats.allocated, 2);
    assert_eq!(stats.reused, 2);
}

#[test]
fn test_custom_decoder_only_runs_for_its_pair() {
    let mut parser = MessageParser::without_decoders(ParserConfig::default());
    parser.register_decoder(
        MessageType::Terrain,
        TerrainMessage::SEND_REDUCED_CHUNK,
        |_header: &ChunkHeader,
         payload: &[u8],
         _pool: &mut BufferPool|
         -> Result<BulkPayload, ParseError> { Ok(BulkPayload::Raw(payload.to_vec())) },
    );

    let chunk = voxel_message(NOT_HOMOGENEOUS, BulkPayload::Raw(vec![1, 2, 3]));
    parser.feed(&to_bytes(&chunk));
    assert_eq!(parser.next_message().unwrap(), Some(chunk));

    let block = Message::Terrain(TerrainMessage::ReducedBlock(ChunkData {
        header: ChunkHeader {
            world_x: 0,
            world_y: 0,
            world_z: 0,
            resolution: 0,
            homogeneous: NOT_HOMOGENEOUS,
        },
        payload: BulkPayload::Raw(vec![9]),
    }));
    parser.feed(&to_bytes(&block));
    assert!(matches!(
        parser.next_message(),
        Err(ParseError::MissingDecoder {
            ty: MessageType::Terrain,
            subtype: TerrainMessage::SEND_REDUCED_BLOCK
        })
    ));
}

#[test]
fn test_incomplete_bulk_message_does_not_invoke_decoder() {
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let seen = std::sync::Arc::clone(&calls);
    let mut parser = MessageParser::without_decoders(ParserConfig::default());
    parser.register_decoder(
        MessageType::Terrain,
        TerrainMessage::SEND_REDUCED_CHUNK,
        move |_: &ChunkHeader, payload: &[u8], _: &mut BufferPool| -> Result<BulkPayload, ParseError> {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(BulkPayload::Raw(payload.to_vec()))
        },
    );

    let bytes = to_bytes(&voxel_message(NOT_HOMOGENEOUS, BulkPayload::Raw(vec![0; 64])));
    parser.feed(&bytes[..40]);
    assert!(parser.next_message().unwrap().is_none());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    parser.feed(&bytes[40..]);
    assert!(parser.next_message().unwrap().is_some());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn test_transition_and_tree_messages_decode() {
    let messages = vec![
        Message::Sync(SyncMessage::Transition {
            target: target(8, 1, 0),
            state: 3,
        }),
        Message::Sync(SyncMessage::AttachTree {
            entity_id: ServerId(8),
            tree_id: TreeId(4),
        }),
        Message::Sync(SyncMessage::RequestAction {
            entity_id: ServerId(8),
            tree_id: TreeId(4),
            value: 1,
        }),
        Message::Terrain(TerrainMessage::RequestReducedBlock(ChunkRequest {
            world_x: 1,
            world_y: 2,
            world_z: 3,
            resolution: 1,
        })),
        Message::Entity(EntityMessage::Destroy {
            entity_id: ServerId(8),
        }),
    ];
    let mut bytes = BytesMut::new();
    for msg in &messages {
        encode(msg, &mut bytes);
    }
    let mut parser = MessageParser::default();
    parser.feed(&bytes);
    assert_eq!(parser.drain().unwrap(), messages);
}
