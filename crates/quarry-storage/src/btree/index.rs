//! B+Tree index over the buffer pool.

use log::debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::btree::iterator::IndexIterator;
use crate::btree::page::{InternalNode, LeafNode, NodeHeader};
use crate::btree::types::{IndexKey, KeyComparator, NodeType};
use crate::header::{lookup_root, HeaderPage};
use quarry_buffer::{BufferPoolManager, PageGuard};
use quarry_common::{PageId, QuarryError, Result, Rid, Transaction, HEADER_PAGE_ID};
use std::cmp::Ordering;

/// Unique-key B+Tree index over paged storage.
///
/// Every page access runs through a [`PageGuard`], so each fetch is paired
/// with exactly one unpin even on early returns and error paths; the net pin
/// count of every operation is zero. The root page id is persisted to the
/// header page whenever it changes, keyed by the index name.
pub struct BPlusTree<K, C> {
    index_name: String,
    root_page_id: AtomicI32,
    pool: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: i32,
    internal_max_size: i32,
    _key: PhantomData<K>,
}

impl<K: IndexKey, C: KeyComparator<K>> BPlusTree<K, C> {
    /// Creates an empty index with page-derived node capacities.
    pub fn new(index_name: impl Into<String>, pool: Arc<BufferPoolManager>, comparator: C) -> Self {
        Self::with_node_capacity(
            index_name,
            pool,
            comparator,
            LeafNode::<K>::default_max_size(),
            InternalNode::<K>::default_max_size(),
        )
    }

    /// Creates an empty index with explicit node capacities.
    ///
    /// Small capacities force deep trees on few keys, which is how the split
    /// and coalesce paths are exercised in tests.
    pub fn with_node_capacity(
        index_name: impl Into<String>,
        pool: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: i32,
        internal_max_size: i32,
    ) -> Self {
        assert!(leaf_max_size >= 2 && internal_max_size >= 3);
        Self {
            index_name: index_name.into(),
            root_page_id: AtomicI32::new(PageId::INVALID.raw()),
            pool,
            comparator,
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        }
    }

    /// Reopens an index by name, reading its root from the header page.
    pub fn open(
        index_name: impl Into<String>,
        pool: Arc<BufferPoolManager>,
        comparator: C,
    ) -> Result<Self> {
        let index_name = index_name.into();
        let root = {
            let guard = pool.fetch_page(HEADER_PAGE_ID)?;
            let data = guard.data();
            lookup_root(&data[..], &index_name)
                .ok_or_else(|| QuarryError::IndexNotFound(index_name.clone()))?
        };

        let tree = Self::new(index_name, pool, comparator);
        tree.root_page_id.store(root.raw(), AtomicOrdering::Release);
        Ok(tree)
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.index_name
    }

    /// Returns the current root page id (`INVALID` when empty).
    pub fn root_page_id(&self) -> PageId {
        PageId::new(self.root_page_id.load(AtomicOrdering::Acquire))
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        !self.root_page_id().is_valid()
    }

    /// Point lookup: returns the rid stored under `key`.
    pub fn get_value(&self, key: &K, _txn: &Transaction) -> Result<Option<Rid>> {
        if self.is_empty() {
            return Ok(None);
        }
        let guard = self.find_leaf(key, false)?;
        let data = guard.data();
        Ok(LeafNode::<K>::lookup_in(&data[..], key, &self.comparator))
    }

    /// Inserts `key -> rid`.
    ///
    /// Keys are unique: inserting an existing key is a no-op returning false.
    pub fn insert(&self, key: K, rid: Rid, _txn: &Transaction) -> Result<bool> {
        if self.is_empty() {
            self.start_new_tree(key, rid)?;
            return Ok(true);
        }
        self.insert_into_leaf(key, rid)
    }

    /// Removes `key`. Missing keys are a no-op.
    pub fn remove(&self, key: &K, _txn: &Transaction) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let mut guard = self.find_leaf(key, false)?;
        {
            let data = guard.data();
            if LeafNode::<K>::lookup_in(&data[..], key, &self.comparator).is_none() {
                return Ok(());
            }
        }

        let (size, min_size, is_root) = {
            let mut data = guard.data_mut();
            let mut leaf = LeafNode::<K>::attach(&mut data[..]);
            match leaf.remove(key, &self.comparator) {
                Some(size) => (size, leaf.min_size(), leaf.is_root()),
                None => return Ok(()),
            }
        };

        if is_root && size == 0 {
            self.adjust_root(guard)?;
        } else if !is_root && size < min_size {
            self.coalesce_or_redistribute(guard)?;
        }
        Ok(())
    }

    /// Ordered iteration over the whole tree.
    pub fn iter(&self) -> Result<IndexIterator<'_, K>> {
        if self.is_empty() {
            return Ok(IndexIterator::end(&self.pool));
        }
        let guard = self.find_leaf(&K::default(), true)?;
        Ok(IndexIterator::new(&self.pool, guard, 0))
    }

    /// Ordered iteration starting at the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<IndexIterator<'_, K>> {
        if self.is_empty() {
            return Ok(IndexIterator::end(&self.pool));
        }
        let guard = self.find_leaf(key, false)?;
        let position = {
            let data = guard.data();
            LeafNode::<K>::key_index_in(&data[..], key, &self.comparator)
        };
        Ok(IndexIterator::new(&self.pool, guard, position))
    }

    /// Descends from the root to the leaf covering `key`.
    ///
    /// Interior pages are unpinned on the way down; the returned leaf is the
    /// only page still pinned.
    fn find_leaf(&self, key: &K, leftmost: bool) -> Result<PageGuard<'_>> {
        let mut guard = self.pool.fetch_page(self.root_page_id())?;
        loop {
            let next = {
                let data = guard.data();
                match NodeHeader::page_type(&data[..]) {
                    NodeType::Leaf => None,
                    NodeType::Internal => Some(if leftmost {
                        InternalNode::<K>::value_at_in(&data[..], 0)
                    } else {
                        InternalNode::<K>::lookup_in(&data[..], key, &self.comparator)
                    }),
                    NodeType::Invalid => {
                        return Err(QuarryError::IndexCorrupted(format!(
                            "uninitialized node at {}",
                            guard.page_id()
                        )))
                    }
                }
            };
            match next {
                None => return Ok(guard),
                Some(child) => guard = self.pool.fetch_page(child)?,
            }
        }
    }

    /// Creates the first leaf of an empty tree and registers it as root.
    fn start_new_tree(&self, key: K, rid: Rid) -> Result<()> {
        let (page_id, mut guard) = self.pool.new_page()?;
        {
            let mut data = guard.data_mut();
            let mut leaf =
                LeafNode::<K>::init(&mut data[..], page_id, PageId::INVALID, self.leaf_max_size);
            leaf.insert(key, rid, &self.comparator);
        }
        drop(guard);
        self.set_root(page_id)
    }

    fn insert_into_leaf(&self, key: K, rid: Rid) -> Result<bool> {
        let mut guard = self.find_leaf(&key, false)?;
        {
            let data = guard.data();
            if LeafNode::<K>::lookup_in(&data[..], &key, &self.comparator).is_some() {
                return Ok(false);
            }
        }

        let (size, max_size) = {
            let mut data = guard.data_mut();
            let mut leaf = LeafNode::<K>::attach(&mut data[..]);
            (leaf.insert(key, rid, &self.comparator), leaf.max_size())
        };

        if size > max_size {
            let (separator, new_guard) = self.split_leaf(&mut guard)?;
            self.insert_into_parent(guard, separator, new_guard)?;
        }
        Ok(true)
    }

    /// Splits an overflowing leaf, splicing the new node in as its
    /// successor. Returns the separator (the new node's first key) and the
    /// pinned new node.
    fn split_leaf(&self, old: &mut PageGuard<'_>) -> Result<(K, PageGuard<'_>)> {
        let (new_page_id, mut new_guard) = self.pool.new_page()?;

        let (separator, old_next) = {
            let mut old_data = old.data_mut();
            let mut old_leaf = LeafNode::<K>::attach(&mut old_data[..]);
            let mut new_data = new_guard.data_mut();
            let mut new_leaf = LeafNode::<K>::init(
                &mut new_data[..],
                new_page_id,
                old_leaf.parent_page_id(),
                old_leaf.max_size(),
            );
            let old_next = old_leaf.next_page_id();
            old_leaf.move_half_to(&mut new_leaf);
            (new_leaf.key_at(0), old_next)
        };

        // The node on the other side of the splice points back at the new
        // leaf.
        if old_next.is_valid() {
            let mut next_guard = self.pool.fetch_page(old_next)?;
            let mut data = next_guard.data_mut();
            LeafNode::<K>::attach(&mut data[..]).set_prev_page_id(new_page_id);
        }

        Ok((separator, new_guard))
    }

    /// Splits an overflowing internal node and re-parents the moved
    /// children. Returns the promoted separator and the pinned new node.
    fn split_internal(&self, old: &mut PageGuard<'_>) -> Result<(K, PageGuard<'_>)> {
        let (new_page_id, mut new_guard) = self.pool.new_page()?;

        let (separator, moved_children) = {
            let mut old_data = old.data_mut();
            let mut old_node = InternalNode::<K>::attach(&mut old_data[..]);
            let mut new_data = new_guard.data_mut();
            let mut new_node = InternalNode::<K>::init(
                &mut new_data[..],
                new_page_id,
                old_node.parent_page_id(),
                old_node.max_size(),
            );
            old_node.move_half_to(&mut new_node);
            let moved: Vec<PageId> = (0..new_node.size() as usize)
                .map(|i| new_node.value_at(i))
                .collect();
            (new_node.key_at(0), moved)
        };

        for child in moved_children {
            let mut guard = self.pool.fetch_page(child)?;
            let mut data = guard.data_mut();
            NodeHeader::set_parent_page_id(&mut data[..], new_page_id);
        }

        Ok((separator, new_guard))
    }

    /// Inserts the separator for a freshly split pair into their parent,
    /// growing a new root or splitting the parent recursively as needed.
    fn insert_into_parent(&self, mut old: PageGuard<'_>, separator: K, mut new: PageGuard<'_>) -> Result<()> {
        let parent_id = {
            let data = old.data();
            NodeHeader::parent_page_id(&data[..])
        };

        if !parent_id.is_valid() {
            // The old node was the root: grow the tree by one level.
            let (root_id, mut root_guard) = self.pool.new_page()?;
            {
                let mut data = root_guard.data_mut();
                let mut root = InternalNode::<K>::init(
                    &mut data[..],
                    root_id,
                    PageId::INVALID,
                    self.internal_max_size,
                );
                root.populate_new_root(old.page_id(), &separator, new.page_id());
            }
            {
                let mut data = old.data_mut();
                NodeHeader::set_parent_page_id(&mut data[..], root_id);
            }
            {
                let mut data = new.data_mut();
                NodeHeader::set_parent_page_id(&mut data[..], root_id);
            }
            drop(old);
            drop(new);
            drop(root_guard);
            return self.set_root(root_id);
        }

        let mut parent = self.pool.fetch_page(parent_id)?;
        let (size, max_size) = {
            let mut data = parent.data_mut();
            let mut node = InternalNode::<K>::attach(&mut data[..]);
            let size = node
                .insert_node_after(old.page_id(), &separator, new.page_id())
                .ok_or_else(|| {
                    QuarryError::IndexCorrupted(format!(
                        "{} missing from its parent",
                        old.page_id()
                    ))
                })?;
            (size, node.max_size())
        };
        drop(old);
        drop(new);

        if size > max_size {
            let (separator, new_parent) = self.split_internal(&mut parent)?;
            self.insert_into_parent(parent, separator, new_parent)?;
        }
        Ok(())
    }

    /// Rebalances an underfull non-root node against a sibling.
    ///
    /// The sibling on the right is preferred; the left sibling is used only
    /// for the rightmost child. Redistribution moves a single pair when the
    /// two nodes together overflow one node; otherwise the node is coalesced
    /// into the sibling and deleted.
    fn coalesce_or_redistribute(&self, node: PageGuard<'_>) -> Result<()> {
        let node_id = node.page_id();
        let parent_id = {
            let data = node.data();
            NodeHeader::parent_page_id(&data[..])
        };

        let parent = self.pool.fetch_page(parent_id)?;
        let (node_index, sibling_id, sibling_on_right) = {
            let data = parent.data();
            let parent_size = NodeHeader::size(&data[..]) as usize;
            let index = InternalNode::<K>::value_index_in(&data[..], node_id).ok_or_else(|| {
                QuarryError::IndexCorrupted(format!("{} missing from its parent", node_id))
            })?;
            if parent_size < 2 {
                return Err(QuarryError::IndexCorrupted(format!(
                    "{} has an underfull parent with no sibling",
                    node_id
                )));
            }
            if index + 1 < parent_size {
                (
                    index,
                    InternalNode::<K>::value_at_in(&data[..], index + 1),
                    true,
                )
            } else {
                (
                    index,
                    InternalNode::<K>::value_at_in(&data[..], index - 1),
                    false,
                )
            }
        };

        let sibling = self.pool.fetch_page(sibling_id)?;
        let (node_size, sibling_size, max_size) = {
            let node_data = node.data();
            let sibling_data = sibling.data();
            (
                NodeHeader::size(&node_data[..]),
                NodeHeader::size(&sibling_data[..]),
                NodeHeader::max_size(&node_data[..]),
            )
        };

        if node_size + sibling_size > max_size {
            self.redistribute(node, sibling, parent, node_index, sibling_on_right)
        } else {
            self.coalesce(node, sibling, parent, node_index, sibling_on_right)
        }
    }

    /// Moves one pair from the sibling into the underfull node and rewrites
    /// the parent separator between them. No node is deleted.
    fn redistribute(
        &self,
        mut node: PageGuard<'_>,
        mut sibling: PageGuard<'_>,
        mut parent: PageGuard<'_>,
        node_index: usize,
        sibling_on_right: bool,
    ) -> Result<()> {
        let node_id = node.page_id();
        let is_leaf = {
            let data = node.data();
            NodeHeader::page_type(&data[..]) == NodeType::Leaf
        };

        if is_leaf {
            let mut node_data = node.data_mut();
            let mut sibling_data = sibling.data_mut();
            let mut parent_data = parent.data_mut();
            let mut n = LeafNode::<K>::attach(&mut node_data[..]);
            let mut s = LeafNode::<K>::attach(&mut sibling_data[..]);
            let mut p = InternalNode::<K>::attach(&mut parent_data[..]);

            if sibling_on_right {
                let separator = n.steal_first_from_right(&mut s);
                p.set_key_at(node_index + 1, &separator);
            } else {
                let separator = n.steal_last_from_left(&mut s);
                p.set_key_at(node_index, &separator);
            }
            return Ok(());
        }

        let moved_child = {
            let mut node_data = node.data_mut();
            let mut sibling_data = sibling.data_mut();
            let mut parent_data = parent.data_mut();
            let mut n = InternalNode::<K>::attach(&mut node_data[..]);
            let mut s = InternalNode::<K>::attach(&mut sibling_data[..]);
            let mut p = InternalNode::<K>::attach(&mut parent_data[..]);

            if sibling_on_right {
                let separator = p.key_at(node_index + 1);
                let new_separator = n.steal_first_from_right(&mut s, &separator);
                p.set_key_at(node_index + 1, &new_separator);
                n.value_at(n.size() as usize - 1)
            } else {
                let separator = p.key_at(node_index);
                let new_separator = n.steal_last_from_left(&mut s, &separator);
                p.set_key_at(node_index, &new_separator);
                n.value_at(0)
            }
        };

        let mut guard = self.pool.fetch_page(moved_child)?;
        let mut data = guard.data_mut();
        NodeHeader::set_parent_page_id(&mut data[..], node_id);
        Ok(())
    }

    /// Merges the underfull node into its sibling, removes the node's slot
    /// from the parent and deletes the node's page, recursing upward when
    /// the parent underflows in turn.
    fn coalesce(
        &self,
        mut node: PageGuard<'_>,
        mut sibling: PageGuard<'_>,
        mut parent: PageGuard<'_>,
        node_index: usize,
        sibling_on_right: bool,
    ) -> Result<()> {
        let node_id = node.page_id();
        let sibling_id = sibling.page_id();

        let is_leaf;
        let mut outer_neighbor = PageId::INVALID;
        let mut moved_children: Vec<PageId> = Vec::new();
        let parent_size;
        let parent_is_root;
        let parent_min;
        {
            let mut node_data = node.data_mut();
            let mut sibling_data = sibling.data_mut();
            let mut parent_data = parent.data_mut();
            is_leaf = NodeHeader::page_type(&node_data[..]) == NodeType::Leaf;
            let mut p = InternalNode::<K>::attach(&mut parent_data[..]);

            if is_leaf {
                let mut n = LeafNode::<K>::attach(&mut node_data[..]);
                let mut s = LeafNode::<K>::attach(&mut sibling_data[..]);
                if sibling_on_right {
                    outer_neighbor = n.prev_page_id();
                    s.absorb_left(&mut n);
                    // The surviving slot inherits the merged range's lower
                    // boundary before the node's slot goes away.
                    let boundary = p.key_at(node_index);
                    p.set_key_at(node_index + 1, &boundary);
                    p.remove_at(node_index);
                } else {
                    outer_neighbor = n.next_page_id();
                    s.absorb_right(&mut n);
                    p.remove_at(node_index);
                }
            } else {
                let mut n = InternalNode::<K>::attach(&mut node_data[..]);
                let mut s = InternalNode::<K>::attach(&mut sibling_data[..]);
                if sibling_on_right {
                    let separator = p.key_at(node_index + 1);
                    let moved = n.size() as usize;
                    s.absorb_left(&mut n, &separator);
                    moved_children = (0..moved).map(|i| s.value_at(i)).collect();
                    let boundary = p.key_at(node_index);
                    p.set_key_at(node_index + 1, &boundary);
                    p.remove_at(node_index);
                } else {
                    let separator = p.key_at(node_index);
                    let old_size = s.size() as usize;
                    s.absorb_right(&mut n, &separator);
                    moved_children = (old_size..s.size() as usize)
                        .map(|i| s.value_at(i))
                        .collect();
                    p.remove_at(node_index);
                }
            }

            parent_size = p.size();
            parent_is_root = p.is_root();
            parent_min = p.min_size();
        }

        // Re-link the leaf chain around the vanished node.
        if is_leaf && outer_neighbor.is_valid() {
            let mut guard = self.pool.fetch_page(outer_neighbor)?;
            let mut data = guard.data_mut();
            let mut outer = LeafNode::<K>::attach(&mut data[..]);
            if sibling_on_right {
                outer.set_next_page_id(sibling_id);
            } else {
                outer.set_prev_page_id(sibling_id);
            }
        }

        for child in moved_children {
            let mut guard = self.pool.fetch_page(child)?;
            let mut data = guard.data_mut();
            NodeHeader::set_parent_page_id(&mut data[..], sibling_id);
        }

        drop(node);
        let deleted = self.pool.delete_page(node_id)?;
        debug_assert!(deleted, "coalesced node must be unpinned before deletion");
        drop(sibling);

        if parent_is_root {
            self.adjust_root(parent)
        } else if parent_size < parent_min {
            self.coalesce_or_redistribute(parent)
        } else {
            Ok(())
        }
    }

    /// Collapses the root after deletions.
    ///
    /// An internal root left with a single child hands the root role to that
    /// child; an empty leaf root empties the tree. Both free the old root
    /// and persist the new root id.
    fn adjust_root(&self, root_guard: PageGuard<'_>) -> Result<()> {
        let root_id = root_guard.page_id();
        let (node_type, size) = {
            let data = root_guard.data();
            (
                NodeHeader::page_type(&data[..]),
                NodeHeader::size(&data[..]),
            )
        };

        match node_type {
            NodeType::Internal if size == 1 => {
                let child = {
                    let data = root_guard.data();
                    InternalNode::<K>::value_at_in(&data[..], 0)
                };
                {
                    let mut guard = self.pool.fetch_page(child)?;
                    let mut data = guard.data_mut();
                    NodeHeader::set_parent_page_id(&mut data[..], PageId::INVALID);
                }
                self.set_root(child)?;
                drop(root_guard);
                let deleted = self.pool.delete_page(root_id)?;
                debug_assert!(deleted);
            }
            NodeType::Leaf if size == 0 => {
                self.set_root(PageId::INVALID)?;
                drop(root_guard);
                let deleted = self.pool.delete_page(root_id)?;
                debug_assert!(deleted);
            }
            _ => {}
        }
        Ok(())
    }

    /// Records a root change in memory and in the header page.
    fn set_root(&self, root: PageId) -> Result<()> {
        self.root_page_id.store(root.raw(), AtomicOrdering::Release);
        debug!("index {} root is now {}", self.index_name, root);

        let mut guard = self.pool.fetch_page(HEADER_PAGE_ID)?;
        let mut data = guard.data_mut();
        HeaderPage::attach(&mut data[..]).set_record(&self.index_name, root)
    }

    /// Debug walk validating structural invariants.
    ///
    /// Checks parent pointers, per-node size bounds, in-node and cross-leaf
    /// key ordering, child-pointer uniqueness, separator ranges and the
    /// doubly-linked leaf chain.
    pub fn check_integrity(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        self.verify_node(self.root_page_id(), PageId::INVALID, None, None)?;
        self.verify_leaf_chain()
    }

    fn verify_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<K>,
        upper: Option<K>,
    ) -> Result<()> {
        let corrupted = |reason: String| QuarryError::IndexCorrupted(reason);

        let children = {
            let guard = self.pool.fetch_page(page_id)?;
            let data = guard.data();
            let data = &data[..];

            if NodeHeader::parent_page_id(data) != expected_parent {
                return Err(corrupted(format!("{} has a stale parent pointer", page_id)));
            }

            let size = NodeHeader::size(data);
            let is_root = !expected_parent.is_valid();
            if !is_root && (size < NodeHeader::min_size(data) || size > NodeHeader::max_size(data))
            {
                return Err(corrupted(format!(
                    "{} size {} outside [{}, {}]",
                    page_id,
                    size,
                    NodeHeader::min_size(data),
                    NodeHeader::max_size(data)
                )));
            }

            match NodeHeader::page_type(data) {
                NodeType::Leaf => {
                    for i in 0..size as usize {
                        let key = LeafNode::<K>::key_at_in(data, i);
                        if i > 0 {
                            let prev = LeafNode::<K>::key_at_in(data, i - 1);
                            if self.comparator.compare(&prev, &key) != Ordering::Less {
                                return Err(corrupted(format!("{} keys out of order", page_id)));
                            }
                        }
                        self.check_bounds(page_id, &key, &lower, &upper)?;
                    }
                    Vec::new()
                }
                NodeType::Internal => {
                    let size = size as usize;
                    let mut children = Vec::with_capacity(size);
                    for i in 1..size {
                        let key = InternalNode::<K>::key_at_in(data, i);
                        if i > 1 {
                            let prev = InternalNode::<K>::key_at_in(data, i - 1);
                            if self.comparator.compare(&prev, &key) != Ordering::Less {
                                return Err(corrupted(format!(
                                    "{} separators out of order",
                                    page_id
                                )));
                            }
                        }
                        self.check_bounds(page_id, &key, &lower, &upper)?;
                    }
                    for i in 0..size {
                        let child = InternalNode::<K>::value_at_in(data, i);
                        if !child.is_valid() {
                            return Err(corrupted(format!("{} has an invalid child", page_id)));
                        }
                        if children.iter().any(|(c, _, _)| *c == child) {
                            return Err(corrupted(format!("{} has a duplicated child", page_id)));
                        }
                        let child_lower = if i == 0 {
                            lower
                        } else {
                            Some(InternalNode::<K>::key_at_in(data, i))
                        };
                        let child_upper = if i + 1 < size {
                            Some(InternalNode::<K>::key_at_in(data, i + 1))
                        } else {
                            upper
                        };
                        children.push((child, child_lower, child_upper));
                    }
                    children
                }
                NodeType::Invalid => {
                    return Err(corrupted(format!("uninitialized node at {}", page_id)))
                }
            }
        };

        for (child, child_lower, child_upper) in children {
            self.verify_node(child, page_id, child_lower, child_upper)?;
        }
        Ok(())
    }

    fn check_bounds(
        &self,
        page_id: PageId,
        key: &K,
        lower: &Option<K>,
        upper: &Option<K>,
    ) -> Result<()> {
        if let Some(lower) = lower {
            if self.comparator.compare(key, lower) == Ordering::Less {
                return Err(QuarryError::IndexCorrupted(format!(
                    "{} holds a key below its range",
                    page_id
                )));
            }
        }
        if let Some(upper) = upper {
            if self.comparator.compare(key, upper) != Ordering::Less {
                return Err(QuarryError::IndexCorrupted(format!(
                    "{} holds a key above its range",
                    page_id
                )));
            }
        }
        Ok(())
    }

    fn verify_leaf_chain(&self) -> Result<()> {
        let corrupted = |reason: String| QuarryError::IndexCorrupted(reason);

        let mut guard = self.find_leaf(&K::default(), true)?;
        {
            let data = guard.data();
            if LeafNode::<K>::prev_page_id_in(&data[..]).is_valid() {
                return Err(corrupted("leftmost leaf has a predecessor".to_string()));
            }
        }

        let mut last_key: Option<K> = None;
        loop {
            let (page_id, next) = {
                let data = guard.data();
                let data = &data[..];
                for i in 0..NodeHeader::size(data) as usize {
                    let key = LeafNode::<K>::key_at_in(data, i);
                    if let Some(last) = &last_key {
                        if self.comparator.compare(last, &key) != Ordering::Less {
                            return Err(corrupted("leaf chain keys out of order".to_string()));
                        }
                    }
                    last_key = Some(key);
                }
                (NodeHeader::page_id(data), LeafNode::<K>::next_page_id_in(data))
            };

            if !next.is_valid() {
                return Ok(());
            }
            let next_guard = self.pool.fetch_page(next)?;
            {
                let data = next_guard.data();
                if LeafNode::<K>::prev_page_id_in(&data[..]) != page_id {
                    return Err(corrupted("leaf chain back-link broken".to_string()));
                }
            }
            guard = next_guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::types::{GenericComparator, GenericKey};
    use crate::header::bootstrap_header;
    use quarry_disk::{DiskManager, DiskManagerConfig};
    use tempfile::tempdir;

    type Key = GenericKey<8>;
    type Tree = BPlusTree<Key, GenericComparator<8>>;

    fn key(v: i64) -> Key {
        Key::from_integer(v)
    }

    fn rid(v: i64) -> Rid {
        Rid::new(PageId::new(v as i32), v as u32)
    }

    fn create_test_tree(
        leaf_max: i32,
        internal_max: i32,
    ) -> (Tree, Arc<BufferPoolManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                db_path: dir.path().join("tree.db"),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        let pool = Arc::new(BufferPoolManager::new(64, disk));
        bootstrap_header(&pool).unwrap();
        let tree = Tree::with_node_capacity(
            "test_index",
            Arc::clone(&pool),
            GenericComparator::<8>,
            leaf_max,
            internal_max,
        );
        (tree, pool, dir)
    }

    #[test]
    fn test_tree_starts_empty() {
        let (tree, _pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), PageId::INVALID);
        assert_eq!(tree.get_value(&key(1), &txn).unwrap(), None);
        tree.remove(&key(1), &txn).unwrap(); // no-op
    }

    #[test]
    fn test_tree_single_insert_get() {
        let (tree, pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        assert!(tree.insert(key(42), rid(42), &txn).unwrap());
        assert!(!tree.is_empty());
        assert_eq!(tree.get_value(&key(42), &txn).unwrap(), Some(rid(42)));
        assert_eq!(tree.get_value(&key(41), &txn).unwrap(), None);

        // Net pin count of every operation is zero.
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_tree_duplicate_insert_keeps_original() {
        let (tree, _pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        assert!(tree.insert(key(7), rid(7), &txn).unwrap());
        assert!(!tree.insert(key(7), rid(999), &txn).unwrap());
        assert_eq!(tree.get_value(&key(7), &txn).unwrap(), Some(rid(7)));
    }

    #[test]
    fn test_tree_root_registered_in_header() {
        let (tree, pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        tree.insert(key(1), rid(1), &txn).unwrap();
        let root = tree.root_page_id();

        let guard = pool.fetch_page(HEADER_PAGE_ID).unwrap();
        let data = guard.data();
        assert_eq!(lookup_root(&data[..], "test_index"), Some(root));
    }

    #[test]
    fn test_tree_split_to_new_root() {
        let (tree, pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        let leaf_root = {
            for v in 1..=4i64 {
                tree.insert(key(v), rid(v), &txn).unwrap();
            }
            tree.root_page_id()
        };

        // Fifth insert overflows the root leaf and grows a new root.
        tree.insert(key(5), rid(5), &txn).unwrap();
        assert_ne!(tree.root_page_id(), leaf_root);

        for v in 1..=5i64 {
            assert_eq!(tree.get_value(&key(v), &txn).unwrap(), Some(rid(v)));
        }
        tree.check_integrity().unwrap();
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_tree_cascading_splits() {
        let (tree, pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        for v in 1..=100i64 {
            assert!(tree.insert(key(v), rid(v), &txn).unwrap());
        }
        for v in 1..=100i64 {
            assert_eq!(tree.get_value(&key(v), &txn).unwrap(), Some(rid(v)));
        }
        tree.check_integrity().unwrap();
        assert_eq!(pool.stats().pinned_frames, 0);
    }

    #[test]
    fn test_tree_reverse_insert_order() {
        let (tree, _pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        for v in (1..=60i64).rev() {
            assert!(tree.insert(key(v), rid(v), &txn).unwrap());
        }
        for v in 1..=60i64 {
            assert_eq!(tree.get_value(&key(v), &txn).unwrap(), Some(rid(v)));
        }
        tree.check_integrity().unwrap();
    }

    #[test]
    fn test_tree_remove_without_underflow() {
        let (tree, _pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        for v in 1..=4i64 {
            tree.insert(key(v), rid(v), &txn).unwrap();
        }
        tree.remove(&key(2), &txn).unwrap();

        assert_eq!(tree.get_value(&key(2), &txn).unwrap(), None);
        assert_eq!(tree.get_value(&key(3), &txn).unwrap(), Some(rid(3)));
        tree.check_integrity().unwrap();
    }

    #[test]
    fn test_tree_delete_to_empty() {
        let (tree, pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        for v in 1..=20i64 {
            tree.insert(key(v), rid(v), &txn).unwrap();
        }
        for v in 1..=20i64 {
            tree.remove(&key(v), &txn).unwrap();
            tree.check_integrity().unwrap();
        }

        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), PageId::INVALID);
        assert_eq!(pool.stats().pinned_frames, 0);

        // The tree is usable again after emptying.
        tree.insert(key(5), rid(5), &txn).unwrap();
        assert_eq!(tree.get_value(&key(5), &txn).unwrap(), Some(rid(5)));
    }

    #[test]
    fn test_tree_open_by_name() {
        let (tree, pool, _dir) = create_test_tree(4, 4);
        let txn = Transaction::default();

        for v in 1..=10i64 {
            tree.insert(key(v), rid(v), &txn).unwrap();
        }
        let root = tree.root_page_id();
        drop(tree);

        let reopened = Tree::open("test_index", Arc::clone(&pool), GenericComparator::<8>).unwrap();
        assert_eq!(reopened.root_page_id(), root);
        assert_eq!(reopened.get_value(&key(6), &txn).unwrap(), Some(rid(6)));
    }

    #[test]
    fn test_tree_open_unknown_name() {
        let (_tree, pool, _dir) = create_test_tree(4, 4);
        let result = Tree::open("missing", pool, GenericComparator::<8>);
        assert!(matches!(result, Err(QuarryError::IndexNotFound(_))));
    }
}
