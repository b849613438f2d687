//! Bulk chunk payloads and the buffer pool they are drawn from.
//!
//! Reduced terrain and block chunks are the only messages large enough to
//! matter for allocation churn. Their arrays come from a [`BufferPool`] owned
//! by the parser (single writer). Consumers hand them back through a
//! cloneable [`PoolReleaser`] once they are done with them.
//!
//! # Payload layouts
//!
//! ```text
//! voxel chunk: 17^3 f32 weights, then 17^3 i32 types   (x, then z, then y innermost)
//! block chunk: 64^3 i16 types,   then 64^3 i16 metadata
//! ```
//!
//! When the header marks the chunk homogeneous, the payload is a single
//! sentinel byte instead.

use bytes::{Buf, BufMut, BytesMut};
use crossbeam_channel::{Receiver, Sender};

use crate::messages::ChunkHeader;
use crate::parser::ParseError;

/// Samples per axis of a reduced voxel chunk (16 cells plus the shared edge).
pub const VOXEL_DIM: usize = 17;
/// Samples in one reduced voxel chunk.
pub const VOXEL_COUNT: usize = VOXEL_DIM * VOXEL_DIM * VOXEL_DIM;
/// Blocks per axis of a block chunk.
pub const BLOCK_DIM: usize = 64;
/// Blocks in one block chunk.
pub const BLOCK_COUNT: usize = BLOCK_DIM * BLOCK_DIM * BLOCK_DIM;
/// The single payload byte sent for homogeneous chunks.
pub const HOMOGENEOUS_SENTINEL: u8 = 0xFF;

/// Wire size of a full voxel chunk payload.
pub const VOXEL_PAYLOAD_LEN: usize = VOXEL_COUNT * 4 * 2;
/// Wire size of a full block chunk payload.
pub const BLOCK_PAYLOAD_LEN: usize = BLOCK_COUNT * 2 * 2;

/// Default cap on retained buffers per element type.
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// A buffer returned to the pool.
#[derive(Debug)]
pub enum PooledBuffer {
    F32(Vec<f32>),
    I32(Vec<i32>),
    I16(Vec<i16>),
}

/// Lifetime counters for a [`BufferPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers freshly allocated because the free list was empty.
    pub allocated: u64,
    /// Buffers served from the free list.
    pub reused: u64,
    /// Buffers handed back through a [`PoolReleaser`] and retained.
    pub released: u64,
    /// Released buffers dropped because the free list was full.
    pub discarded: u64,
}

/// Handle for returning buffers to a [`BufferPool`] from any thread.
#[derive(Debug, Clone)]
pub struct PoolReleaser {
    tx: Sender<PooledBuffer>,
}

impl PoolReleaser {
    /// Return a buffer. If the pool has been dropped the buffer is freed.
    pub fn release(&self, buffer: PooledBuffer) {
        let _ = self.tx.send(buffer);
    }
}

/// Free lists of chunk arrays, one per element type.
///
/// Only the owner takes buffers; returned buffers queue on a channel and are
/// folded back into the free lists on the next take.
pub struct BufferPool {
    f32s: Vec<Vec<f32>>,
    i32s: Vec<Vec<i32>>,
    i16s: Vec<Vec<i16>>,
    capacity: usize,
    stats: PoolStats,
    release_tx: Sender<PooledBuffer>,
    release_rx: Receiver<PooledBuffer>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl BufferPool {
    /// Create a pool retaining at most `capacity` buffers per element type.
    pub fn new(capacity: usize) -> Self {
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        Self {
            f32s: Vec::new(),
            i32s: Vec::new(),
            i16s: Vec::new(),
            capacity,
            stats: PoolStats::default(),
            release_tx,
            release_rx,
        }
    }

    /// A handle consumers use to give buffers back.
    pub fn releaser(&self) -> PoolReleaser {
        PoolReleaser {
            tx: self.release_tx.clone(),
        }
    }

    /// Pool counters so far.
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Buffers currently sitting in the free lists.
    pub fn idle(&self) -> usize {
        self.f32s.len() + self.i32s.len() + self.i16s.len()
    }

    /// Fold released buffers back into the free lists.
    pub fn reclaim(&mut self) {
        while let Ok(buffer) = self.release_rx.try_recv() {
            let retained = match buffer {
                PooledBuffer::F32(v) => Self::retain(&mut self.f32s, v, self.capacity),
                PooledBuffer::I32(v) => Self::retain(&mut self.i32s, v, self.capacity),
                PooledBuffer::I16(v) => Self::retain(&mut self.i16s, v, self.capacity),
            };
            if retained {
                self.stats.released += 1;
            } else {
                self.stats.discarded += 1;
            }
        }
    }

    /// An empty `f32` buffer with room for `len` elements.
    pub fn take_f32(&mut self, len: usize) -> Vec<f32> {
        self.reclaim();
        Self::take(&mut self.f32s, &mut self.stats, len)
    }

    /// An empty `i32` buffer with room for `len` elements.
    pub fn take_i32(&mut self, len: usize) -> Vec<i32> {
        self.reclaim();
        Self::take(&mut self.i32s, &mut self.stats, len)
    }

    /// An empty `i16` buffer with room for `len` elements.
    pub fn take_i16(&mut self, len: usize) -> Vec<i16> {
        self.reclaim();
        Self::take(&mut self.i16s, &mut self.stats, len)
    }

    fn take<T>(list: &mut Vec<Vec<T>>, stats: &mut PoolStats, len: usize) -> Vec<T> {
        match list.pop() {
            Some(mut buf) => {
                stats.reused += 1;
                buf.clear();
                buf.reserve(len);
                buf
            }
            None => {
                stats.allocated += 1;
                Vec::with_capacity(len)
            }
        }
    }

    fn retain<T>(list: &mut Vec<Vec<T>>, buf: Vec<T>, capacity: usize) -> bool {
        if list.len() >= capacity {
            return false;
        }
        list.push(buf);
        true
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Reduced-resolution terrain samples.
#[derive(Debug, Clone, PartialEq)]
pub enum VoxelChunk {
    /// Every sample has this type and zero weight.
    Homogeneous(i32),
    /// Full sample arrays in wire order.
    Full { weights: Vec<f32>, types: Vec<i32> },
}

impl VoxelChunk {
    /// Flat index of `(x, y, z)` in wire order.
    pub fn index(x: usize, y: usize, z: usize) -> usize {
        (x * VOXEL_DIM + z) * VOXEL_DIM + y
    }

    /// Terrain type at a sample.
    pub fn voxel_type(&self, x: usize, y: usize, z: usize) -> i32 {
        match self {
            Self::Homogeneous(value) => *value,
            Self::Full { types, .. } => types[Self::index(x, y, z)],
        }
    }

    /// Surface weight at a sample.
    pub fn weight(&self, x: usize, y: usize, z: usize) -> f32 {
        match self {
            Self::Homogeneous(_) => 0.0,
            Self::Full { weights, .. } => weights[Self::index(x, y, z)],
        }
    }
}

/// Block types and metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockChunk {
    Homogeneous(i16),
    Full { types: Vec<i16>, metadata: Vec<i16> },
}

impl BlockChunk {
    /// Flat index of `(x, y, z)` in wire order.
    pub fn index(x: usize, y: usize, z: usize) -> usize {
        (x * BLOCK_DIM + z) * BLOCK_DIM + y
    }

    /// Block type at a position.
    pub fn block_type(&self, x: usize, y: usize, z: usize) -> i16 {
        match self {
            Self::Homogeneous(value) => *value,
            Self::Full { types, .. } => types[Self::index(x, y, z)],
        }
    }
}

/// Output of a bulk decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkPayload {
    Voxel(VoxelChunk),
    Block(BlockChunk),
    /// Undecoded bytes, for caller-registered decoders that keep them as-is.
    Raw(Vec<u8>),
}

impl BulkPayload {
    /// Append the wire form of this payload.
    pub fn encode_into(&self, out: &mut BytesMut) {
        match self {
            Self::Voxel(VoxelChunk::Homogeneous(_)) | Self::Block(BlockChunk::Homogeneous(_)) => {
                out.put_u8(HOMOGENEOUS_SENTINEL);
            }
            Self::Voxel(VoxelChunk::Full { weights, types }) => {
                weights.iter().for_each(|w| out.put_f32(*w));
                types.iter().for_each(|t| out.put_i32(*t));
            }
            Self::Block(BlockChunk::Full { types, metadata }) => {
                types.iter().for_each(|t| out.put_i16(*t));
                metadata.iter().for_each(|m| out.put_i16(*m));
            }
            Self::Raw(bytes) => out.put_slice(bytes),
        }
    }

    /// Length of the wire form.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Voxel(VoxelChunk::Homogeneous(_)) | Self::Block(BlockChunk::Homogeneous(_)) => 1,
            Self::Voxel(VoxelChunk::Full { weights, types }) => (weights.len() + types.len()) * 4,
            Self::Block(BlockChunk::Full { types, metadata }) => {
                (types.len() + metadata.len()) * 2
            }
            Self::Raw(bytes) => bytes.len(),
        }
    }

    /// Return owned arrays to the pool.
    pub fn release(self, releaser: &PoolReleaser) {
        match self {
            Self::Voxel(VoxelChunk::Full { weights, types }) => {
                releaser.release(PooledBuffer::F32(weights));
                releaser.release(PooledBuffer::I32(types));
            }
            Self::Block(BlockChunk::Full { types, metadata }) => {
                releaser.release(PooledBuffer::I16(types));
                releaser.release(PooledBuffer::I16(metadata));
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

/// Decodes the bulk payload of one (type, subtype) pair.
pub trait BulkDecoder: Send + Sync {
    /// Decode `payload`, whose length the wire already declared.
    fn decode(
        &self,
        header: &ChunkHeader,
        payload: &[u8],
        pool: &mut BufferPool,
    ) -> Result<BulkPayload, ParseError>;
}

impl<F> BulkDecoder for F
where
    F: Fn(&ChunkHeader, &[u8], &mut BufferPool) -> Result<BulkPayload, ParseError> + Send + Sync,
{
    fn decode(
        &self,
        header: &ChunkHeader,
        payload: &[u8],
        pool: &mut BufferPool,
    ) -> Result<BulkPayload, ParseError> {
        self(header, payload, pool)
    }
}

/// Checks the one-byte homogeneous payload. A wrong sentinel is tolerated.
fn check_sentinel(header: &ChunkHeader, payload: &[u8]) -> Result<(), ParseError> {
    match payload {
        [HOMOGENEOUS_SENTINEL] => Ok(()),
        [other] => {
            tracing::warn!(
                sentinel = *other,
                world_x = header.world_x,
                world_y = header.world_y,
                world_z = header.world_z,
                "Homogeneous chunk carried an unexpected sentinel byte"
            );
            Ok(())
        }
        _ => Err(ParseError::PayloadSize {
            expected: 1,
            actual: payload.len(),
        }),
    }
}

/// Built-in decoder for reduced terrain chunks.
pub fn decode_voxel_chunk(
    header: &ChunkHeader,
    payload: &[u8],
    pool: &mut BufferPool,
) -> Result<BulkPayload, ParseError> {
    if header.is_homogeneous() {
        check_sentinel(header, payload)?;
        return Ok(BulkPayload::Voxel(VoxelChunk::Homogeneous(header.homogeneous)));
    }
    if payload.len() != VOXEL_PAYLOAD_LEN {
        return Err(ParseError::PayloadSize {
            expected: VOXEL_PAYLOAD_LEN,
            actual: payload.len(),
        });
    }

    let mut cur = payload;
    let mut weights = pool.take_f32(VOXEL_COUNT);
    weights.extend((0..VOXEL_COUNT).map(|_| cur.get_f32()));
    let mut types = pool.take_i32(VOXEL_COUNT);
    types.extend((0..VOXEL_COUNT).map(|_| cur.get_i32()));
    Ok(BulkPayload::Voxel(VoxelChunk::Full { weights, types }))
}

/// Built-in decoder for block chunks.
pub fn decode_block_chunk(
    header: &ChunkHeader,
    payload: &[u8],
    pool: &mut BufferPool,
) -> Result<BulkPayload, ParseError> {
    if header.is_homogeneous() {
        check_sentinel(header, payload)?;
        return Ok(BulkPayload::Block(BlockChunk::Homogeneous(
            header.homogeneous as i16,
        )));
    }
    if payload.len() != BLOCK_PAYLOAD_LEN {
        return Err(ParseError::PayloadSize {
            expected: BLOCK_PAYLOAD_LEN,
            actual: payload.len(),
        });
    }

    let mut cur = payload;
    let mut types = pool.take_i16(BLOCK_COUNT);
    types.extend((0..BLOCK_COUNT).map(|_| cur.get_i16()));
    let mut metadata = pool.take_i16(BLOCK_COUNT);
    metadata.extend((0..BLOCK_COUNT).map(|_| cur.get_i16()));
    Ok(BulkPayload::Block(BlockChunk::Full { types, metadata }))
}
