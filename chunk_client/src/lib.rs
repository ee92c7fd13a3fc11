//! The node-to-node chunk I/O contract.
//!
//! Readers return blocks by index; writers stream blocks to a replica set and
//! finalize with the chunk meta. The physical transport and on-disk format
//! are external concerns; the in-memory [`MemoryChunkStore`] implements the
//! same traits for unit tests and single-process deployments.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use bytes::Bytes;
use data_types::{ChunkId, ChunkMeta};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

/// Errors of the chunk I/O layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Lookup by chunk id failed.
    #[error("no such chunk: {chunk_id}")]
    NoSuchChunk {
        /// The missing chunk.
        chunk_id: ChunkId,
    },

    /// A block index beyond the written range was requested.
    #[error("block {block_index} out of range for chunk {chunk_id} ({block_count} blocks)")]
    BlockOutOfRange {
        /// The chunk read from.
        chunk_id: ChunkId,
        /// The out-of-range index.
        block_index: usize,
        /// Number of blocks the chunk has.
        block_count: usize,
    },

    /// The writer was closed twice or written after close.
    #[error("chunk writer for {chunk_id} already closed")]
    WriterClosed {
        /// The chunk being written.
        chunk_id: ChunkId,
    },
}

/// Result alias for chunk I/O.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One block of chunk data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block(pub Bytes);

impl Block {
    /// Byte size of the block.
    pub fn size(&self) -> usize {
        self.0.len()
    }
}

/// Identifies one block of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    /// The owning chunk.
    pub chunk_id: ChunkId,
    /// Index of the block within the chunk.
    pub block_index: usize,
}

/// The representation a cached block is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Caching disabled.
    None,
    /// Compressed, as on disk.
    CompressedData,
    /// Decompressed.
    UncompressedData,
}

/// A sink for blocks observed while a chunk is written or read.
pub trait BlockCache: Send + Sync + std::fmt::Debug {
    /// Offer a block to the cache. The cache may ignore it.
    fn put(&self, id: BlockId, block_type: BlockType, block: Block);

    /// Look up a cached block.
    fn find(&self, id: BlockId, block_type: BlockType) -> Option<Block>;

    /// The single block type this cache stores.
    fn supported_block_type(&self) -> BlockType;
}

/// A cache that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBlockCache;

impl BlockCache for NullBlockCache {
    fn put(&self, _id: BlockId, _block_type: BlockType, _block: Block) {}

    fn find(&self, _id: BlockId, _block_type: BlockType) -> Option<Block> {
        None
    }

    fn supported_block_type(&self) -> BlockType {
        BlockType::None
    }
}

/// Reads blocks of one chunk.
#[async_trait]
pub trait ChunkReader: Send + Sync + std::fmt::Debug {
    /// The chunk this reader serves.
    fn chunk_id(&self) -> ChunkId;

    /// Fetch the chunk meta.
    async fn meta(&self) -> Result<ChunkMeta>;

    /// Read `count` blocks starting at `first_block_index`. Short reads are
    /// legal; an empty result means the range is exhausted.
    async fn read_blocks(&self, first_block_index: usize, count: usize) -> Result<Vec<Block>>;
}

/// Streams blocks of one new chunk to its replica set.
#[async_trait]
pub trait ChunkWriter: Send + Sync + std::fmt::Debug {
    /// The chunk being produced.
    fn chunk_id(&self) -> ChunkId;

    /// Append a block.
    async fn write_block(&self, block: Block) -> Result<()>;

    /// Finalize the chunk with its meta. No writes may follow.
    async fn close(&self, meta: ChunkMeta) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredChunk {
    meta: ChunkMeta,
    blocks: Vec<Block>,
}

/// An in-memory chunk store acting as both reader and writer factory.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<ChunkId, StoredChunk>>,
}

impl MemoryChunkStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A reader over a stored chunk; the chunk need not exist yet, reads
    /// fail until it does.
    pub fn reader(self: &Arc<Self>, chunk_id: ChunkId) -> MemoryChunkReader {
        MemoryChunkReader {
            store: Arc::clone(self),
            chunk_id,
        }
    }

    /// A writer producing `chunk_id` into this store.
    pub fn writer(self: &Arc<Self>, chunk_id: ChunkId) -> MemoryChunkWriter {
        MemoryChunkWriter {
            store: Arc::clone(self),
            chunk_id,
            pending: parking_lot::Mutex::new(Some(Vec::new())),
        }
    }

    /// Whether `chunk_id` has been written and closed.
    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        self.chunks.read().contains_key(&chunk_id)
    }

    /// Drop a stored chunk, returning whether it existed.
    pub fn remove(&self, chunk_id: ChunkId) -> bool {
        self.chunks.write().remove(&chunk_id).is_some()
    }

    /// Ids of all stored chunks.
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.read().keys().copied().collect()
    }
}

/// [`ChunkReader`] over a [`MemoryChunkStore`].
#[derive(Debug)]
pub struct MemoryChunkReader {
    store: Arc<MemoryChunkStore>,
    chunk_id: ChunkId,
}

#[async_trait]
impl ChunkReader for MemoryChunkReader {
    fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    async fn meta(&self) -> Result<ChunkMeta> {
        let chunks = self.store.chunks.read();
        let chunk = chunks.get(&self.chunk_id).ok_or(Error::NoSuchChunk {
            chunk_id: self.chunk_id,
        })?;
        Ok(chunk.meta.clone())
    }

    async fn read_blocks(&self, first_block_index: usize, count: usize) -> Result<Vec<Block>> {
        let chunks = self.store.chunks.read();
        let chunk = chunks.get(&self.chunk_id).ok_or(Error::NoSuchChunk {
            chunk_id: self.chunk_id,
        })?;
        if first_block_index > chunk.blocks.len() {
            return Err(Error::BlockOutOfRange {
                chunk_id: self.chunk_id,
                block_index: first_block_index,
                block_count: chunk.blocks.len(),
            });
        }
        let end = first_block_index.saturating_add(count).min(chunk.blocks.len());
        Ok(chunk.blocks[first_block_index..end].to_vec())
    }
}

/// [`ChunkWriter`] into a [`MemoryChunkStore`].
#[derive(Debug)]
pub struct MemoryChunkWriter {
    store: Arc<MemoryChunkStore>,
    chunk_id: ChunkId,
    pending: parking_lot::Mutex<Option<Vec<Block>>>,
}

#[async_trait]
impl ChunkWriter for MemoryChunkWriter {
    fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    async fn write_block(&self, block: Block) -> Result<()> {
        let mut pending = self.pending.lock();
        pending
            .as_mut()
            .ok_or(Error::WriterClosed {
                chunk_id: self.chunk_id,
            })?
            .push(block);
        Ok(())
    }

    async fn close(&self, meta: ChunkMeta) -> Result<()> {
        let blocks = self
            .pending
            .lock()
            .take()
            .ok_or(Error::WriterClosed {
                chunk_id: self.chunk_id,
            })?;
        self.store
            .chunks
            .write()
            .insert(self.chunk_id, StoredChunk { meta, blocks });
        Ok(())
    }
}

/// A [`ChunkWriter`] that offers every written block to a [`BlockCache`]
/// before forwarding it, which is how in-memory tablets capture chunk data at
/// write time.
#[derive(Debug)]
pub struct InterceptingChunkWriter<W> {
    inner: W,
    cache: Arc<dyn BlockCache>,
    next_block_index: parking_lot::Mutex<usize>,
}

impl<W: ChunkWriter> InterceptingChunkWriter<W> {
    /// Wrap `inner` so that written blocks are also offered to `cache`.
    pub fn new(inner: W, cache: Arc<dyn BlockCache>) -> Self {
        Self {
            inner,
            cache,
            next_block_index: parking_lot::Mutex::new(0),
        }
    }
}

#[async_trait]
impl<W: ChunkWriter> ChunkWriter for InterceptingChunkWriter<W> {
    fn chunk_id(&self) -> ChunkId {
        self.inner.chunk_id()
    }

    async fn write_block(&self, block: Block) -> Result<()> {
        let block_index = {
            let mut next = self.next_block_index.lock();
            let index = *next;
            *next += 1;
            index
        };
        self.cache.put(
            BlockId {
                chunk_id: self.inner.chunk_id(),
                block_index,
            },
            self.cache.supported_block_type(),
            block.clone(),
        );
        self.inner.write_block(block).await
    }

    async fn close(&self, meta: ChunkMeta) -> Result<()> {
        self.inner.close(meta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{EntityKind, MiscExt};

    fn chunk_id(unique: u64) -> ChunkId {
        ChunkId::new(EntityKind::Chunk, unique)
    }

    fn meta_with_rows(row_count: i64) -> ChunkMeta {
        ChunkMeta {
            misc: Some(MiscExt {
                row_count,
                ..Default::default()
            }),
            blocks: None,
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let store = MemoryChunkStore::new();
        let id = chunk_id(1);

        let writer = store.writer(id);
        writer.write_block(Block(Bytes::from_static(b"one"))).await.unwrap();
        writer.write_block(Block(Bytes::from_static(b"two"))).await.unwrap();
        writer.close(meta_with_rows(2)).await.unwrap();

        let reader = store.reader(id);
        assert_eq!(reader.meta().await.unwrap().misc.unwrap().row_count, 2);

        let blocks = reader.read_blocks(0, 10).await.unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].0.as_ref(), b"two");

        // Short read past the end.
        assert!(reader.read_blocks(2, 1).await.unwrap().is_empty());
        assert!(reader.read_blocks(3, 1).await.is_err());
    }

    #[tokio::test]
    async fn reading_missing_chunk_fails() {
        let store = MemoryChunkStore::new();
        let reader = store.reader(chunk_id(42));
        assert!(matches!(
            reader.meta().await,
            Err(Error::NoSuchChunk { .. })
        ));
    }

    #[tokio::test]
    async fn writer_rejects_use_after_close() {
        let store = MemoryChunkStore::new();
        let writer = store.writer(chunk_id(7));
        writer.close(ChunkMeta::default()).await.unwrap();

        assert!(matches!(
            writer.write_block(Block(Bytes::new())).await,
            Err(Error::WriterClosed { .. })
        ));
        assert!(matches!(
            writer.close(ChunkMeta::default()).await,
            Err(Error::WriterClosed { .. })
        ));
    }

    #[derive(Debug, Default)]
    struct RecordingCache {
        seen: parking_lot::Mutex<Vec<BlockId>>,
    }

    impl BlockCache for RecordingCache {
        fn put(&self, id: BlockId, _block_type: BlockType, _block: Block) {
            self.seen.lock().push(id);
        }

        fn find(&self, _id: BlockId, _block_type: BlockType) -> Option<Block> {
            None
        }

        fn supported_block_type(&self) -> BlockType {
            BlockType::CompressedData
        }
    }

    #[tokio::test]
    async fn intercepting_writer_offers_blocks_in_order() {
        let store = MemoryChunkStore::new();
        let id = chunk_id(3);
        let cache = Arc::new(RecordingCache::default());
        let writer = InterceptingChunkWriter::new(store.writer(id), Arc::clone(&cache) as _);

        writer.write_block(Block(Bytes::from_static(b"a"))).await.unwrap();
        writer.write_block(Block(Bytes::from_static(b"b"))).await.unwrap();
        writer.close(ChunkMeta::default()).await.unwrap();

        let seen = cache.seen.lock();
        assert_eq!(
            *seen,
            vec![
                BlockId {
                    chunk_id: id,
                    block_index: 0
                },
                BlockId {
                    chunk_id: id,
                    block_index: 1
                },
            ]
        );
        assert!(store.contains(id));
    }
}
