//! B+Tree node layouts over raw page buffers.
//!
//! Every node lives in the data region of one page. Both kinds share a
//! 24-byte header; leaves add sibling links and store `(key, rid)` pairs,
//! internals store `(key, child page id)` pairs where slot 0's key is an
//! unused "-inf" sentinel.
//!
//! Shared header (24 bytes):
//! ```text
//! | page_type(4) | size(4) | max_size(4) | parent_page_id(4) | page_id(4) | lsn(4) |
//! ```
//! Leaf header adds (8 bytes): `prev_page_id(4) | next_page_id(4)`.
//!
//! All fields are little-endian fixed-width integers in declaration order.
//! The pair region is sized for `max_size + 1` entries, leaving one spare
//! slot so a node can briefly overflow between insert and split.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::btree::types::{IndexKey, KeyComparator, NodeType};
use quarry_common::{PageId, Rid, INVALID_LSN};

const TYPE_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 4;
const MAX_SIZE_OFFSET: usize = 8;
const PARENT_OFFSET: usize = 12;
const PAGE_ID_OFFSET: usize = 16;
const LSN_OFFSET: usize = 20;

/// Size of the header shared by both node kinds.
pub const NODE_HEADER_SIZE: usize = 24;

const PREV_OFFSET: usize = 24;
const NEXT_OFFSET: usize = 28;

/// Size of the leaf header (shared header plus sibling links).
pub const LEAF_HEADER_SIZE: usize = 32;

/// Size of the internal header (the shared header only).
pub const INTERNAL_HEADER_SIZE: usize = NODE_HEADER_SIZE;

#[inline]
fn read_i32(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
fn write_i32(data: &mut [u8], offset: usize, value: i32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Accessors for the header shared by leaf and internal nodes.
pub struct NodeHeader;

impl NodeHeader {
    /// Returns the node kind tag.
    pub fn page_type(data: &[u8]) -> NodeType {
        NodeType::from_i32(read_i32(data, TYPE_OFFSET))
    }

    pub fn set_page_type(data: &mut [u8], node_type: NodeType) {
        write_i32(data, TYPE_OFFSET, node_type as i32);
    }

    /// Returns the number of pairs in the node.
    pub fn size(data: &[u8]) -> i32 {
        read_i32(data, SIZE_OFFSET)
    }

    pub fn set_size(data: &mut [u8], size: i32) {
        write_i32(data, SIZE_OFFSET, size);
    }

    /// Returns the node's pair capacity.
    pub fn max_size(data: &[u8]) -> i32 {
        read_i32(data, MAX_SIZE_OFFSET)
    }

    pub fn set_max_size(data: &mut [u8], max_size: i32) {
        write_i32(data, MAX_SIZE_OFFSET, max_size);
    }

    /// Returns the parent page id (`INVALID` for the root).
    pub fn parent_page_id(data: &[u8]) -> PageId {
        PageId::new(read_i32(data, PARENT_OFFSET))
    }

    pub fn set_parent_page_id(data: &mut [u8], parent: PageId) {
        write_i32(data, PARENT_OFFSET, parent.raw());
    }

    /// Returns the node's own page id.
    pub fn page_id(data: &[u8]) -> PageId {
        PageId::new(read_i32(data, PAGE_ID_OFFSET))
    }

    pub fn set_page_id(data: &mut [u8], page_id: PageId) {
        write_i32(data, PAGE_ID_OFFSET, page_id.raw());
    }

    pub fn set_lsn(data: &mut [u8], lsn: i32) {
        write_i32(data, LSN_OFFSET, lsn);
    }

    /// Returns true if this node is the root.
    pub fn is_root(data: &[u8]) -> bool {
        !Self::parent_page_id(data).is_valid()
    }

    /// Returns the minimum legal pair count for this node.
    ///
    /// Non-root nodes must stay at or above `ceil(max_size / 2)`; a root leaf
    /// may shrink to one pair and a root internal to two.
    pub fn min_size(data: &[u8]) -> i32 {
        if Self::is_root(data) {
            match Self::page_type(data) {
                NodeType::Leaf => 1,
                NodeType::Internal => 2,
                NodeType::Invalid => 0,
            }
        } else {
            (Self::max_size(data) + 1) / 2
        }
    }

    fn init(data: &mut [u8], node_type: NodeType, page_id: PageId, parent: PageId, max_size: i32) {
        Self::set_page_type(data, node_type);
        Self::set_size(data, 0);
        Self::set_max_size(data, max_size);
        Self::set_parent_page_id(data, parent);
        Self::set_page_id(data, page_id);
        Self::set_lsn(data, INVALID_LSN);
    }
}

/// Mutable view of a leaf node.
pub struct LeafNode<'a, K> {
    data: &'a mut [u8],
    _key: PhantomData<K>,
}

impl<'a, K: IndexKey> LeafNode<'a, K> {
    const PAIR_SIZE: usize = K::SIZE + Rid::SIZE;

    /// Initializes an empty leaf in `data` and attaches to it.
    pub fn init(data: &'a mut [u8], page_id: PageId, parent: PageId, max_size: i32) -> Self {
        NodeHeader::init(data, NodeType::Leaf, page_id, parent, max_size);
        write_i32(data, PREV_OFFSET, PageId::INVALID.raw());
        write_i32(data, NEXT_OFFSET, PageId::INVALID.raw());
        Self {
            data,
            _key: PhantomData,
        }
    }

    /// Attaches to an initialized leaf.
    pub fn attach(data: &'a mut [u8]) -> Self {
        debug_assert_eq!(NodeHeader::page_type(data), NodeType::Leaf);
        Self {
            data,
            _key: PhantomData,
        }
    }

    /// Default pair capacity for this key width.
    pub fn default_max_size() -> i32 {
        ((quarry_common::PAGE_SIZE - LEAF_HEADER_SIZE) / Self::PAIR_SIZE - 1) as i32
    }

    pub fn size(&self) -> i32 {
        NodeHeader::size(self.data)
    }

    pub fn max_size(&self) -> i32 {
        NodeHeader::max_size(self.data)
    }

    pub fn min_size(&self) -> i32 {
        NodeHeader::min_size(self.data)
    }

    pub fn page_id(&self) -> PageId {
        NodeHeader::page_id(self.data)
    }

    pub fn parent_page_id(&self) -> PageId {
        NodeHeader::parent_page_id(self.data)
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        NodeHeader::set_parent_page_id(self.data, parent);
    }

    pub fn is_root(&self) -> bool {
        NodeHeader::is_root(self.data)
    }

    pub fn prev_page_id(&self) -> PageId {
        PageId::new(read_i32(self.data, PREV_OFFSET))
    }

    pub fn set_prev_page_id(&mut self, prev: PageId) {
        write_i32(self.data, PREV_OFFSET, prev.raw());
    }

    pub fn next_page_id(&self) -> PageId {
        Self::next_page_id_in(self.data)
    }

    pub fn set_next_page_id(&mut self, next: PageId) {
        write_i32(self.data, NEXT_OFFSET, next.raw());
    }

    /// Reads the next-leaf link from raw leaf bytes.
    pub fn next_page_id_in(data: &[u8]) -> PageId {
        PageId::new(read_i32(data, NEXT_OFFSET))
    }

    /// Reads the previous-leaf link from raw leaf bytes.
    pub fn prev_page_id_in(data: &[u8]) -> PageId {
        PageId::new(read_i32(data, PREV_OFFSET))
    }

    #[inline]
    fn pair_offset(index: usize) -> usize {
        LEAF_HEADER_SIZE + index * Self::PAIR_SIZE
    }

    /// Reads the key at `index` from raw leaf bytes.
    pub fn key_at_in(data: &[u8], index: usize) -> K {
        K::read_from(&data[Self::pair_offset(index)..])
    }

    /// Reads the rid at `index` from raw leaf bytes.
    pub fn value_at_in(data: &[u8], index: usize) -> Rid {
        Rid::read_from(&data[Self::pair_offset(index) + K::SIZE..])
    }

    pub fn key_at(&self, index: usize) -> K {
        Self::key_at_in(self.data, index)
    }

    pub fn value_at(&self, index: usize) -> Rid {
        Self::value_at_in(self.data, index)
    }

    fn set_pair_at(&mut self, index: usize, key: &K, rid: &Rid) {
        let offset = Self::pair_offset(index);
        key.write_to(&mut self.data[offset..]);
        rid.write_to(&mut self.data[offset + K::SIZE..]);
    }

    /// Returns the first slot whose key is >= `key` (== size when none is).
    pub fn key_index_in<C: KeyComparator<K>>(data: &[u8], key: &K, comparator: &C) -> usize {
        let mut begin = 0usize;
        let mut end = NodeHeader::size(data) as usize;
        while begin < end {
            let mid = begin + (end - begin) / 2;
            if comparator.compare(key, &Self::key_at_in(data, mid)) == Ordering::Greater {
                begin = mid + 1;
            } else {
                end = mid;
            }
        }
        begin
    }

    pub fn key_index<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> usize {
        Self::key_index_in(self.data, key, comparator)
    }

    /// Point lookup in raw leaf bytes.
    pub fn lookup_in<C: KeyComparator<K>>(data: &[u8], key: &K, comparator: &C) -> Option<Rid> {
        let index = Self::key_index_in(data, key, comparator);
        if index < NodeHeader::size(data) as usize
            && comparator.compare(key, &Self::key_at_in(data, index)) == Ordering::Equal
        {
            Some(Self::value_at_in(data, index))
        } else {
            None
        }
    }

    pub fn lookup<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> Option<Rid> {
        Self::lookup_in(self.data, key, comparator)
    }

    /// Inserts a pair in key order. Returns the new size.
    ///
    /// The caller must have ruled out a duplicate; the spare slot allows the
    /// size to reach `max_size + 1` until the node is split.
    pub fn insert<C: KeyComparator<K>>(&mut self, key: K, rid: Rid, comparator: &C) -> i32 {
        let index = self.key_index(&key, comparator);
        let size = self.size() as usize;
        let start = Self::pair_offset(index);
        let end = Self::pair_offset(size);
        self.data.copy_within(start..end, start + Self::PAIR_SIZE);
        self.set_pair_at(index, &key, &rid);
        NodeHeader::set_size(self.data, size as i32 + 1);
        size as i32 + 1
    }

    /// Removes `key` if present. Returns the new size, or None when absent.
    pub fn remove<C: KeyComparator<K>>(&mut self, key: &K, comparator: &C) -> Option<i32> {
        let index = self.key_index(key, comparator);
        let size = self.size() as usize;
        if index >= size || comparator.compare(key, &self.key_at(index)) != Ordering::Equal {
            return None;
        }
        let start = Self::pair_offset(index + 1);
        let end = Self::pair_offset(size);
        self.data
            .copy_within(start..end, Self::pair_offset(index));
        NodeHeader::set_size(self.data, size as i32 - 1);
        Some(size as i32 - 1)
    }

    /// Moves the upper half of this node's pairs to the empty `recipient`
    /// and splices it into the leaf chain as this node's successor.
    ///
    /// The caller fixes the old successor's `prev` link.
    pub fn move_half_to(&mut self, recipient: &mut LeafNode<'_, K>) {
        debug_assert_eq!(recipient.size(), 0);
        let size = self.size() as usize;
        let split = ((self.max_size() + 1) / 2) as usize;
        let moved = size - split;

        let src = Self::pair_offset(split)..Self::pair_offset(size);
        recipient.data[Self::pair_offset(0)..Self::pair_offset(moved)]
            .copy_from_slice(&self.data[src]);

        NodeHeader::set_size(self.data, split as i32);
        NodeHeader::set_size(recipient.data, moved as i32);

        recipient.set_next_page_id(self.next_page_id());
        recipient.set_prev_page_id(self.page_id());
        let recipient_id = recipient.page_id();
        self.set_next_page_id(recipient_id);
    }

    /// Appends every pair of the right sibling `src`, absorbing it.
    ///
    /// Takes over `src`'s next link; the caller fixes the outer neighbor's
    /// `prev` link and deletes `src`'s page.
    pub fn absorb_right(&mut self, src: &mut LeafNode<'_, K>) {
        let size = self.size() as usize;
        let moved = src.size() as usize;

        self.data[Self::pair_offset(size)..Self::pair_offset(size + moved)]
            .copy_from_slice(&src.data[Self::pair_offset(0)..Self::pair_offset(moved)]);

        NodeHeader::set_size(self.data, (size + moved) as i32);
        NodeHeader::set_size(src.data, 0);
        let next = src.next_page_id();
        self.set_next_page_id(next);
    }

    /// Prepends every pair of the left sibling `src`, absorbing it.
    ///
    /// Takes over `src`'s prev link; the caller fixes the outer neighbor's
    /// `next` link and deletes `src`'s page.
    pub fn absorb_left(&mut self, src: &mut LeafNode<'_, K>) {
        let size = self.size() as usize;
        let moved = src.size() as usize;

        self.data.copy_within(
            Self::pair_offset(0)..Self::pair_offset(size),
            Self::pair_offset(moved),
        );
        self.data[Self::pair_offset(0)..Self::pair_offset(moved)]
            .copy_from_slice(&src.data[Self::pair_offset(0)..Self::pair_offset(moved)]);

        NodeHeader::set_size(self.data, (size + moved) as i32);
        NodeHeader::set_size(src.data, 0);
        let prev = src.prev_page_id();
        self.set_prev_page_id(prev);
    }

    /// Moves the right sibling's first pair to this node's end.
    ///
    /// Returns the sibling's new first key, the replacement separator.
    pub fn steal_first_from_right(&mut self, right: &mut LeafNode<'_, K>) -> K {
        let key = right.key_at(0);
        let rid = right.value_at(0);
        let size = self.size() as usize;
        self.set_pair_at(size, &key, &rid);
        NodeHeader::set_size(self.data, size as i32 + 1);

        let right_size = right.size() as usize;
        right.data.copy_within(
            Self::pair_offset(1)..Self::pair_offset(right_size),
            Self::pair_offset(0),
        );
        NodeHeader::set_size(right.data, right_size as i32 - 1);
        right.key_at(0)
    }

    /// Moves the left sibling's last pair to this node's front.
    ///
    /// Returns this node's new first key, the replacement separator.
    pub fn steal_last_from_left(&mut self, left: &mut LeafNode<'_, K>) -> K {
        let left_size = left.size() as usize;
        let key = left.key_at(left_size - 1);
        let rid = left.value_at(left_size - 1);
        NodeHeader::set_size(left.data, left_size as i32 - 1);

        let size = self.size() as usize;
        self.data.copy_within(
            Self::pair_offset(0)..Self::pair_offset(size),
            Self::pair_offset(1),
        );
        self.set_pair_at(0, &key, &rid);
        NodeHeader::set_size(self.data, size as i32 + 1);
        key
    }
}

/// Mutable view of an internal node.
///
/// Slot 0's key is never compared; `value_at(0)` is the leftmost child and
/// child `i` covers keys in `[key_at(i), key_at(i + 1))` for `i >= 1`.
pub struct InternalNode<'a, K> {
    data: &'a mut [u8],
    _key: PhantomData<K>,
}

impl<'a, K: IndexKey> InternalNode<'a, K> {
    const PAIR_SIZE: usize = K::SIZE + 4;

    /// Initializes an empty internal node in `data` and attaches to it.
    pub fn init(data: &'a mut [u8], page_id: PageId, parent: PageId, max_size: i32) -> Self {
        NodeHeader::init(data, NodeType::Internal, page_id, parent, max_size);
        Self {
            data,
            _key: PhantomData,
        }
    }

    /// Attaches to an initialized internal node.
    pub fn attach(data: &'a mut [u8]) -> Self {
        debug_assert_eq!(NodeHeader::page_type(data), NodeType::Internal);
        Self {
            data,
            _key: PhantomData,
        }
    }

    /// Default pair capacity for this key width.
    pub fn default_max_size() -> i32 {
        ((quarry_common::PAGE_SIZE - INTERNAL_HEADER_SIZE) / Self::PAIR_SIZE - 1) as i32
    }

    pub fn size(&self) -> i32 {
        NodeHeader::size(self.data)
    }

    pub fn max_size(&self) -> i32 {
        NodeHeader::max_size(self.data)
    }

    pub fn min_size(&self) -> i32 {
        NodeHeader::min_size(self.data)
    }

    pub fn page_id(&self) -> PageId {
        NodeHeader::page_id(self.data)
    }

    pub fn parent_page_id(&self) -> PageId {
        NodeHeader::parent_page_id(self.data)
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        NodeHeader::set_parent_page_id(self.data, parent);
    }

    pub fn is_root(&self) -> bool {
        NodeHeader::is_root(self.data)
    }

    #[inline]
    fn pair_offset(index: usize) -> usize {
        INTERNAL_HEADER_SIZE + index * Self::PAIR_SIZE
    }

    /// Reads the key at `index` from raw internal-node bytes.
    pub fn key_at_in(data: &[u8], index: usize) -> K {
        K::read_from(&data[Self::pair_offset(index)..])
    }

    /// Reads the child page id at `index` from raw internal-node bytes.
    pub fn value_at_in(data: &[u8], index: usize) -> PageId {
        PageId::new(read_i32(data, Self::pair_offset(index) + K::SIZE))
    }

    pub fn key_at(&self, index: usize) -> K {
        Self::key_at_in(self.data, index)
    }

    pub fn set_key_at(&mut self, index: usize, key: &K) {
        key.write_to(&mut self.data[Self::pair_offset(index)..]);
    }

    pub fn value_at(&self, index: usize) -> PageId {
        Self::value_at_in(self.data, index)
    }

    pub fn set_value_at(&mut self, index: usize, value: PageId) {
        write_i32(self.data, Self::pair_offset(index) + K::SIZE, value.raw());
    }

    /// Returns the slot whose child pointer equals `value`.
    pub fn value_index_in(data: &[u8], value: PageId) -> Option<usize> {
        (0..NodeHeader::size(data) as usize).find(|&i| Self::value_at_in(data, i) == value)
    }

    pub fn value_index(&self, value: PageId) -> Option<usize> {
        Self::value_index_in(self.data, value)
    }

    /// Returns the child covering `key`: the largest slot `i >= 1` with
    /// `key_at(i) <= key`, or the leftmost child when no such slot exists.
    pub fn lookup_in<C: KeyComparator<K>>(data: &[u8], key: &K, comparator: &C) -> PageId {
        let mut begin = 1usize;
        let mut end = NodeHeader::size(data) as usize;
        while begin < end {
            let mid = begin + (end - begin) / 2;
            if comparator.compare(key, &Self::key_at_in(data, mid)) == Ordering::Less {
                end = mid;
            } else {
                begin = mid + 1;
            }
        }
        Self::value_at_in(data, begin - 1)
    }

    pub fn lookup<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> PageId {
        Self::lookup_in(self.data, key, comparator)
    }

    /// Fills a fresh root after the old root split: `(-, old)` and
    /// `(key, new)`.
    pub fn populate_new_root(&mut self, old_value: PageId, key: &K, new_value: PageId) {
        self.set_value_at(0, old_value);
        self.set_key_at(1, key);
        self.set_value_at(1, new_value);
        NodeHeader::set_size(self.data, 2);
    }

    /// Inserts `(key, new_value)` immediately after the slot whose child is
    /// `old_value`. Returns the new size, or None when `old_value` is not a
    /// child of this node.
    pub fn insert_node_after(&mut self, old_value: PageId, key: &K, new_value: PageId) -> Option<i32> {
        let old_index = self.value_index(old_value)?;
        let index = old_index + 1;
        let size = self.size() as usize;
        let start = Self::pair_offset(index);
        let end = Self::pair_offset(size);
        self.data.copy_within(start..end, start + Self::PAIR_SIZE);
        self.set_key_at(index, key);
        self.set_value_at(index, new_value);
        NodeHeader::set_size(self.data, size as i32 + 1);
        Some(size as i32 + 1)
    }

    /// Removes the slot at `index`, shifting later slots down.
    pub fn remove_at(&mut self, index: usize) {
        let size = self.size() as usize;
        debug_assert!(index < size);
        let start = Self::pair_offset(index + 1);
        let end = Self::pair_offset(size);
        self.data
            .copy_within(start..end, Self::pair_offset(index));
        NodeHeader::set_size(self.data, size as i32 - 1);
    }

    /// Moves the upper half of this node's slots to the empty `recipient`.
    ///
    /// The split slot's key travels with it into `recipient` slot 0, where
    /// it is readable as the separator to push up. The caller re-parents the
    /// moved children.
    pub fn move_half_to(&mut self, recipient: &mut InternalNode<'_, K>) {
        debug_assert_eq!(recipient.size(), 0);
        let size = self.size() as usize;
        let split = ((self.max_size() + 1) / 2) as usize;
        let moved = size - split;

        let src = Self::pair_offset(split)..Self::pair_offset(size);
        recipient.data[Self::pair_offset(0)..Self::pair_offset(moved)]
            .copy_from_slice(&self.data[src]);

        NodeHeader::set_size(self.data, split as i32);
        NodeHeader::set_size(recipient.data, moved as i32);
    }

    /// Appends every slot of the right sibling `src` under the pulled-down
    /// `separator`, absorbing it.
    ///
    /// The caller re-parents the moved children and deletes `src`'s page.
    pub fn absorb_right(&mut self, src: &mut InternalNode<'_, K>, separator: &K) {
        let size = self.size() as usize;
        let moved = src.size() as usize;

        self.data[Self::pair_offset(size)..Self::pair_offset(size + moved)]
            .copy_from_slice(&src.data[Self::pair_offset(0)..Self::pair_offset(moved)]);
        self.set_key_at(size, separator);

        NodeHeader::set_size(self.data, (size + moved) as i32);
        NodeHeader::set_size(src.data, 0);
    }

    /// Prepends every slot of the left sibling `src`, pulling `separator`
    /// down onto this node's old leftmost slot, absorbing `src`.
    ///
    /// The caller re-parents the moved children and deletes `src`'s page.
    pub fn absorb_left(&mut self, src: &mut InternalNode<'_, K>, separator: &K) {
        let size = self.size() as usize;
        let moved = src.size() as usize;

        self.data.copy_within(
            Self::pair_offset(0)..Self::pair_offset(size),
            Self::pair_offset(moved),
        );
        self.data[Self::pair_offset(0)..Self::pair_offset(moved)]
            .copy_from_slice(&src.data[Self::pair_offset(0)..Self::pair_offset(moved)]);
        self.set_key_at(moved, separator);

        NodeHeader::set_size(self.data, (size + moved) as i32);
        NodeHeader::set_size(src.data, 0);
    }

    /// Rotates the right sibling's first child into this node's last slot
    /// under the pulled-down `separator`.
    ///
    /// Returns the replacement separator (the right sibling's promoted key).
    /// The caller re-parents the moved child.
    pub fn steal_first_from_right(&mut self, right: &mut InternalNode<'_, K>, separator: &K) -> K {
        let size = self.size() as usize;
        self.set_key_at(size, separator);
        self.set_value_at(size, right.value_at(0));
        NodeHeader::set_size(self.data, size as i32 + 1);

        let new_separator = right.key_at(1);
        right.remove_at(0);
        new_separator
    }

    /// Rotates the left sibling's last child into this node's first slot,
    /// pushing the pulled-down `separator` onto the old leftmost slot.
    ///
    /// Returns the replacement separator (the left sibling's removed key).
    /// The caller re-parents the moved child.
    pub fn steal_last_from_left(&mut self, left: &mut InternalNode<'_, K>, separator: &K) -> K {
        let left_size = left.size() as usize;
        let new_separator = left.key_at(left_size - 1);
        let moved_child = left.value_at(left_size - 1);
        NodeHeader::set_size(left.data, left_size as i32 - 1);

        let size = self.size() as usize;
        self.data.copy_within(
            Self::pair_offset(0)..Self::pair_offset(size),
            Self::pair_offset(1),
        );
        self.set_key_at(1, separator);
        self.set_value_at(0, moved_child);
        NodeHeader::set_size(self.data, size as i32 + 1);
        new_separator
    }
}
