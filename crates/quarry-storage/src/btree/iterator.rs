//! Leaf-chain iteration for the B+Tree.

use std::marker::PhantomData;

use crate::btree::page::{LeafNode, NodeHeader};
use crate::btree::types::IndexKey;
use quarry_buffer::{BufferPoolManager, PageGuard};
use quarry_common::Rid;

/// Ordered iterator over `(key, rid)` pairs.
///
/// The iterator owns at most one pinned leaf at a time; crossing to the next
/// leaf unpins the current one before fetching its successor, and exhaustion
/// (or a failed fetch) releases the last pin.
pub struct IndexIterator<'a, K> {
    pool: &'a BufferPoolManager,
    leaf: Option<PageGuard<'a>>,
    position: usize,
    _key: PhantomData<K>,
}

impl<'a, K: IndexKey> IndexIterator<'a, K> {
    pub(crate) fn new(pool: &'a BufferPoolManager, leaf: PageGuard<'a>, position: usize) -> Self {
        Self {
            pool,
            leaf: Some(leaf),
            position,
            _key: PhantomData,
        }
    }

    /// An already exhausted iterator.
    pub(crate) fn end(pool: &'a BufferPoolManager) -> Self {
        Self {
            pool,
            leaf: None,
            position: 0,
            _key: PhantomData,
        }
    }
}

impl<'a, K: IndexKey> Iterator for IndexIterator<'a, K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let leaf = self.leaf.as_ref()?;

            let (size, next_page_id) = {
                let data = leaf.data();
                (
                    NodeHeader::size(&data[..]) as usize,
                    LeafNode::<K>::next_page_id_in(&data[..]),
                )
            };

            if self.position < size {
                let item = {
                    let data = leaf.data();
                    (
                        LeafNode::<K>::key_at_in(&data[..], self.position),
                        LeafNode::<K>::value_at_in(&data[..], self.position),
                    )
                };
                self.position += 1;
                return Some(item);
            }

            // Unpin the exhausted leaf before following the chain.
            self.leaf = None;
            if !next_page_id.is_valid() {
                return None;
            }
            match self.pool.fetch_page(next_page_id) {
                Ok(guard) => {
                    self.leaf = Some(guard);
                    self.position = 0;
                }
                Err(_) => return None,
            }
        }
    }
}
