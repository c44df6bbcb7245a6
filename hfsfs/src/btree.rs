//! Generic B-tree engine over fixed-size nodes.
//!
//! Every tree file starts with a header node (node 0) carrying the
//! `BTHeaderRec` that fixes the node size; all further node reads use that
//! size. Records inside a node are located through a reverse-growing offset
//! table at the node's end. The engine is key-comparator-parameterised:
//! catalog, extents-overflow and attributes trees plug their own orderings
//! in. Mutation stops at the leaf level; nodes are never split here.

use byteorder::{BigEndian, ByteOrder};
use std::cmp::Ordering;
use std::io::{Read, Seek, Write};

use crate::bitmap::Bitmap;
use crate::device::BlockDevice;
use crate::error::{HfsError, Result};
use crate::extents::ForkMap;

/// B-tree node kinds (signed 8-bit on disk; leaf is -1).
pub const NODE_LEAF: u8 = 0xFF;
pub const NODE_INDEX: u8 = 0x00;
pub const NODE_HEADER: u8 = 0x01;
pub const NODE_MAP: u8 = 0x02;

/// Size of the node descriptor at the start of every node.
pub const NODE_DESCRIPTOR_SIZE: usize = 14;

/// Size of the `BTHeaderRec` (record 0 of the header node).
pub const HEADER_RECORD_SIZE: usize = 106;

/// Size of the reserved user-data record following the header record.
pub const USER_DATA_RECORD_SIZE: usize = 128;

// Tree types carried in the header record.
pub const TREE_TYPE_CATALOG: u8 = 0;
pub const TREE_TYPE_EXTENTS: u8 = 255;
pub const TREE_TYPE_ATTRIBUTES: u8 = 0xF0;

// Key-compare types.
pub const KEY_COMPARE_CASE_FOLD: u8 = 0xCF;
pub const KEY_COMPARE_BINARY: u8 = 0xBC;

/// The 14-byte descriptor at the start of every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Next node in this node's chain, 0 for none.
    pub forward_link: u32,
    /// Previous node in this node's chain, 0 for none.
    pub backward_link: u32,
    pub kind: u8,
    /// 1 for leaves, >= 2 for index nodes, 0 for the header node.
    pub height: u8,
    pub num_records: u16,
    pub reserved: u16,
}

impl NodeDescriptor {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < NODE_DESCRIPTOR_SIZE {
            return Err(HfsError::InvalidBTree("node too short for descriptor".into()));
        }
        Ok(NodeDescriptor {
            forward_link: BigEndian::read_u32(&buf[0..]),
            backward_link: BigEndian::read_u32(&buf[4..]),
            kind: buf[8],
            height: buf[9],
            num_records: BigEndian::read_u16(&buf[10..]),
            reserved: BigEndian::read_u16(&buf[12..]),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..], self.forward_link);
        BigEndian::write_u32(&mut buf[4..], self.backward_link);
        buf[8] = self.kind;
        buf[9] = self.height;
        BigEndian::write_u16(&mut buf[10..], self.num_records);
        BigEndian::write_u16(&mut buf[12..], self.reserved);
    }
}

/// The `BTHeaderRec` at byte 14 of node 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub tree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
}

impl HeaderRecord {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_RECORD_SIZE {
            return Err(HfsError::InvalidBTree("header record too short".into()));
        }
        Ok(HeaderRecord {
            tree_depth: BigEndian::read_u16(&buf[0..]),
            root_node: BigEndian::read_u32(&buf[2..]),
            leaf_records: BigEndian::read_u32(&buf[6..]),
            first_leaf_node: BigEndian::read_u32(&buf[10..]),
            last_leaf_node: BigEndian::read_u32(&buf[14..]),
            node_size: BigEndian::read_u16(&buf[18..]),
            max_key_length: BigEndian::read_u16(&buf[20..]),
            total_nodes: BigEndian::read_u32(&buf[22..]),
            free_nodes: BigEndian::read_u32(&buf[26..]),
            // reserved1 at 30
            clump_size: BigEndian::read_u32(&buf[32..]),
            tree_type: buf[36],
            key_compare_type: buf[37],
            attributes: BigEndian::read_u32(&buf[38..]),
            // reserved3: 16 u32s at 42
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[..HEADER_RECORD_SIZE].fill(0);
        BigEndian::write_u16(&mut buf[0..], self.tree_depth);
        BigEndian::write_u32(&mut buf[2..], self.root_node);
        BigEndian::write_u32(&mut buf[6..], self.leaf_records);
        BigEndian::write_u32(&mut buf[10..], self.first_leaf_node);
        BigEndian::write_u32(&mut buf[14..], self.last_leaf_node);
        BigEndian::write_u16(&mut buf[18..], self.node_size);
        BigEndian::write_u16(&mut buf[20..], self.max_key_length);
        BigEndian::write_u32(&mut buf[22..], self.total_nodes);
        BigEndian::write_u32(&mut buf[26..], self.free_nodes);
        BigEndian::write_u32(&mut buf[32..], self.clump_size);
        buf[36] = self.tree_type;
        buf[37] = self.key_compare_type;
        BigEndian::write_u32(&mut buf[38..], self.attributes);
    }

    /// Upper bound on records a node of this size can describe.
    pub fn max_records_per_node(&self) -> u16 {
        ((self.node_size as usize - NODE_DESCRIPTOR_SIZE) / 4) as u16
    }
}

/// A loaded node: descriptor, raw bytes, and the decoded offset table
/// (always `num_records + 1` entries, the last pointing past used space).
#[derive(Debug, Clone)]
pub struct Node {
    pub index: u32,
    pub desc: NodeDescriptor,
    pub data: Vec<u8>,
    pub offsets: Vec<u16>,
}

impl Node {
    /// Parse a node from its raw bytes.
    pub fn parse(index: u32, data: Vec<u8>) -> Result<Self> {
        let desc = NodeDescriptor::decode(&data)?;
        let node_size = data.len();
        let num_offsets = desc.num_records as usize + 1;
        if NODE_DESCRIPTOR_SIZE + num_offsets * 2 > node_size {
            return Err(HfsError::InvalidBTree(format!(
                "node {}: record count {} overflows the node",
                index, desc.num_records
            )));
        }

        let mut offsets = Vec::with_capacity(num_offsets);
        for i in 0..num_offsets {
            let pos = node_size - 2 * (i + 1);
            offsets.push(BigEndian::read_u16(&data[pos..]));
        }

        Ok(Node { index, desc, data, offsets })
    }

    /// Raw bytes of record `i`.
    pub fn record(&self, i: usize) -> Result<&[u8]> {
        if i >= self.desc.num_records as usize {
            return Err(HfsError::InvalidBTree(format!(
                "node {}: record index {} >= {}",
                self.index, i, self.desc.num_records
            )));
        }
        let start = self.offsets[i] as usize;
        let end = self.offsets[i + 1] as usize;
        let table_start = self.data.len() - 2 * self.offsets.len();
        if start < NODE_DESCRIPTOR_SIZE || start > end || end > table_start {
            return Err(HfsError::InvalidBTree(format!(
                "node {}: record {} offsets {}..{} out of bounds",
                self.index, i, start, end
            )));
        }
        Ok(&self.data[start..end])
    }

    /// Bytes available for a new record, accounting for the extra offset
    /// table entry it would need.
    pub fn free_space(&self) -> usize {
        let used = *self.offsets.last().unwrap_or(&(NODE_DESCRIPTOR_SIZE as u16)) as usize;
        let table = 2 * (self.offsets.len() + 1);
        self.data.len().saturating_sub(used + table)
    }

    /// Insert a record before position `at`, shifting later records up.
    pub fn insert_record(&mut self, at: usize, bytes: &[u8]) -> Result<()> {
        let n = self.desc.num_records as usize;
        if at > n {
            return Err(HfsError::InvalidBTree("insert position out of range".into()));
        }
        if bytes.len() > self.free_space() {
            return Err(HfsError::InvalidBTree(format!(
                "node {}: no room for {}-byte record",
                self.index,
                bytes.len()
            )));
        }

        let start = self.offsets[at] as usize;
        let free_start = self.offsets[n] as usize;
        self.data.copy_within(start..free_start, start + bytes.len());
        self.data[start..start + bytes.len()].copy_from_slice(bytes);

        for off in self.offsets.iter_mut().skip(at) {
            *off += bytes.len() as u16;
        }
        self.offsets.insert(at, start as u16);
        self.desc.num_records += 1;
        self.rebuild();
        Ok(())
    }

    /// Remove record `at`, shifting later records down.
    pub fn remove_record(&mut self, at: usize) -> Result<()> {
        let n = self.desc.num_records as usize;
        if at >= n {
            return Err(HfsError::InvalidBTree("remove position out of range".into()));
        }
        let start = self.offsets[at] as usize;
        let end = self.offsets[at + 1] as usize;
        let free_start = self.offsets[n] as usize;
        let len = end - start;

        self.data.copy_within(end..free_start, start);
        self.offsets.remove(at);
        for off in self.offsets.iter_mut().skip(at) {
            *off -= len as u16;
        }
        self.desc.num_records -= 1;
        self.rebuild();
        // Scrub the vacated span so stale bytes never look like a record.
        let new_free = self.offsets[n - 1] as usize;
        let table_start = self.data.len() - 2 * self.offsets.len();
        self.data[new_free..table_start].fill(0);
        Ok(())
    }

    /// Re-encode the descriptor and offset table into the node buffer.
    pub fn rebuild(&mut self) {
        self.desc.encode(&mut self.data[..NODE_DESCRIPTOR_SIZE]);
        let node_size = self.data.len();
        for (i, off) in self.offsets.iter().enumerate() {
            let pos = node_size - 2 * (i + 1);
            BigEndian::write_u16(&mut self.data[pos..], *off);
        }
    }
}

/// An opened B-tree: header record plus the fork mapping of its file.
#[derive(Debug, Clone)]
pub struct BTree {
    pub header: HeaderRecord,
    pub fork: ForkMap,
}

impl BTree {
    /// Open a tree by reading node 0 through the fork's first extent.
    /// The initial read uses 512 bytes, enough for descriptor plus header
    /// record; the definitive `node_size` comes from the header record.
    pub fn open<D: Read + Write + Seek>(
        dev: &mut BlockDevice<D>,
        fork: ForkMap,
    ) -> Result<Self> {
        let mut first = vec![0u8; 512];
        fork.read_exact(dev, 0, &mut first)?;

        let desc = NodeDescriptor::decode(&first)?;
        if desc.kind != NODE_HEADER {
            return Err(HfsError::InvalidBTree(format!(
                "expected header node, got kind {}",
                desc.kind
            )));
        }
        let header = HeaderRecord::decode(&first[NODE_DESCRIPTOR_SIZE..])?;
        if header.node_size < 512 || !header.node_size.is_power_of_two() {
            return Err(HfsError::InvalidBTree(format!(
                "node size {} is not a power of two >= 512",
                header.node_size
            )));
        }
        Ok(BTree { header, fork })
    }

    /// True when the tree holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.header.leaf_records == 0 && self.header.root_node == 0
    }

    pub fn read_node<D: Read + Write + Seek>(
        &self,
        dev: &mut BlockDevice<D>,
        index: u32,
    ) -> Result<Node> {
        let size = self.header.node_size as usize;
        let mut data = vec![0u8; size];
        self.fork.read_exact(dev, index as u64 * size as u64, &mut data)?;
        Node::parse(index, data)
    }

    /// Read a node's raw bytes without building the offset table.
    pub fn read_node_raw<D: Read + Write + Seek>(
        &self,
        dev: &mut BlockDevice<D>,
        index: u32,
    ) -> Result<Vec<u8>> {
        let size = self.header.node_size as usize;
        let mut data = vec![0u8; size];
        self.fork.read_exact(dev, index as u64 * size as u64, &mut data)?;
        Ok(data)
    }

    pub fn write_node<D: Read + Write + Seek>(
        &self,
        dev: &mut BlockDevice<D>,
        node: &Node,
    ) -> Result<()> {
        let size = self.header.node_size as u64;
        self.fork.write_all(dev, node.index as u64 * size, &node.data)
    }

    pub fn write_node_raw<D: Read + Write + Seek>(
        &self,
        dev: &mut BlockDevice<D>,
        index: u32,
        data: &[u8],
    ) -> Result<()> {
        let size = self.header.node_size as u64;
        self.fork.write_all(dev, index as u64 * size, data)
    }

    /// Re-encode the header record into node 0 on disk, preserving the rest
    /// of the header node (user data and map records).
    pub fn write_header<D: Read + Write + Seek>(
        &self,
        dev: &mut BlockDevice<D>,
    ) -> Result<()> {
        let mut node0 = self.read_node_raw(dev, 0)?;
        self.header
            .encode(&mut node0[NODE_DESCRIPTOR_SIZE..NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE]);
        self.write_node_raw(dev, 0, &node0)
    }

    /// Descend from the root to the leaf record matching `compare`, where
    /// `compare` orders a raw record (key first) against the search target.
    /// Returns the leaf node and record index on an exact match.
    pub fn search<D: Read + Write + Seek>(
        &self,
        dev: &mut BlockDevice<D>,
        compare: &dyn Fn(&[u8]) -> Ordering,
    ) -> Result<Option<(Node, usize)>> {
        if self.header.root_node == 0 {
            return Ok(None);
        }

        let mut current = self.header.root_node;
        let mut hops = 0u16;
        loop {
            // Depth guard: a sane tree is never deeper than its header claims.
            hops += 1;
            if hops > self.header.tree_depth.saturating_add(2) {
                return Err(HfsError::InvalidBTree("search descent too deep".into()));
            }

            let node = self.read_node(dev, current)?;
            match node.desc.kind {
                NODE_LEAF => {
                    for i in 0..node.desc.num_records as usize {
                        match compare(node.record(i)?) {
                            Ordering::Equal => return Ok(Some((node, i))),
                            Ordering::Greater => return Ok(None),
                            Ordering::Less => continue,
                        }
                    }
                    return Ok(None);
                }
                NODE_INDEX => {
                    let mut child = None;
                    for i in 0..node.desc.num_records as usize {
                        let record = node.record(i)?;
                        match compare(record) {
                            Ordering::Less | Ordering::Equal => {
                                child = Some(index_child(record)?);
                            }
                            Ordering::Greater => break,
                        }
                    }
                    match child {
                        Some(c) => current = c,
                        None => return Ok(None),
                    }
                }
                other => {
                    return Err(HfsError::InvalidBTree(format!(
                        "unexpected node kind {} during search",
                        other
                    )))
                }
            }
        }
    }

    /// Find the leaf where records matching `compare` would start, following
    /// the leftmost child when every index key is greater than the target.
    pub fn descend_to_leaf<D: Read + Write + Seek>(
        &self,
        dev: &mut BlockDevice<D>,
        compare: &dyn Fn(&[u8]) -> Ordering,
    ) -> Result<u32> {
        if self.header.root_node == 0 {
            return Ok(0);
        }
        let mut current = self.header.root_node;
        let mut hops = 0u16;
        loop {
            hops += 1;
            if hops > self.header.tree_depth.saturating_add(2) {
                return Err(HfsError::InvalidBTree("descent too deep".into()));
            }
            let node = self.read_node(dev, current)?;
            match node.desc.kind {
                NODE_LEAF => return Ok(current),
                NODE_INDEX => {
                    let mut child = None;
                    for i in 0..node.desc.num_records as usize {
                        let record = node.record(i)?;
                        match compare(record) {
                            Ordering::Less | Ordering::Equal => {
                                child = Some(index_child(record)?);
                            }
                            Ordering::Greater => break,
                        }
                    }
                    current = match child {
                        Some(c) => c,
                        None if node.desc.num_records > 0 => index_child(node.record(0)?)?,
                        None => return Ok(0),
                    };
                }
                other => {
                    return Err(HfsError::InvalidBTree(format!(
                        "unexpected node kind {} during descent",
                        other
                    )))
                }
            }
        }
    }

    /// Visit every record of every leaf from `first_leaf_node` forward.
    /// The callback returns `false` to stop the walk early.
    pub fn walk_leaves<D, F>(&self, dev: &mut BlockDevice<D>, mut visit: F) -> Result<()>
    where
        D: Read + Write + Seek,
        F: FnMut(&Node, usize, &[u8]) -> Result<bool>,
    {
        let mut current = self.header.first_leaf_node;
        let mut seen = 0u64;
        while current != 0 {
            let node = self.read_node(dev, current)?;
            if node.desc.kind != NODE_LEAF {
                return Err(HfsError::InvalidBTree(format!(
                    "node {} in leaf chain has kind {}",
                    current, node.desc.kind
                )));
            }
            for i in 0..node.desc.num_records as usize {
                if !visit(&node, i, node.record(i)?)? {
                    return Ok(());
                }
            }
            seen += 1;
            if seen > self.header.total_nodes as u64 {
                return Err(HfsError::InvalidBTree("leaf chain does not terminate".into()));
            }
            current = node.desc.forward_link;
        }
        Ok(())
    }
}

/// Child node number from an index record: the key (with its 1- or 2-byte
/// length prefix) followed by a big-endian u32.
pub fn index_child(record: &[u8]) -> Result<u32> {
    if record.len() < 2 {
        return Err(HfsError::InvalidBTree("index record too short".into()));
    }
    let key_len = BigEndian::read_u16(record) as usize;
    let child_at = 2 + key_len;
    if child_at + 4 > record.len() {
        return Err(HfsError::InvalidBTree(format!(
            "index record too short for child pointer: key_len={}, len={}",
            key_len,
            record.len()
        )));
    }
    Ok(BigEndian::read_u32(&record[child_at..]))
}

// ── Structural validation ────────────────────────────────────────────────

/// A structural defect found while validating a tree.
#[derive(Debug, Clone)]
pub struct Defect {
    pub node: u32,
    pub record: Option<u16>,
    pub kind: DefectKind,
    pub detail: String,
    /// Repair parameter where one exists (e.g. the correct backward link).
    pub hint: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefectKind {
    /// Header bounds: root/first/last/free nodes vs `total_nodes`.
    HeaderBounds,
    /// A node in the leaf chain is not a leaf.
    NodeKind,
    /// `num_records` exceeds what the node can hold.
    RecordCount,
    /// Offset table inconsistent; the node's records are unreadable.
    OffsetTable,
    /// Keys out of ascending order. Unrepairable.
    KeyOrder,
    /// Two adjacent records carry equal keys.
    DuplicateKey,
    /// Chain termination does not match `last_leaf_node`.
    ChainEnd,
    /// Backward link does not point at the previous leaf.
    BackLink,
    /// A node appears twice in the leaf chain.
    Cycle,
    /// Header `leaf_records` disagrees with the walk.
    LeafCount,
}

impl DefectKind {
    /// Whether the engine knows a single-node repair for this defect.
    pub fn repairable(self) -> bool {
        matches!(
            self,
            DefectKind::NodeKind
                | DefectKind::RecordCount
                | DefectKind::DuplicateKey
                | DefectKind::BackLink
                | DefectKind::LeafCount
        )
    }
}

/// Result of a structural walk.
#[derive(Debug, Default)]
pub struct TreeCheck {
    pub defects: Vec<Defect>,
    pub leaf_nodes: u32,
    pub leaf_records: u64,
}

impl TreeCheck {
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.defects.iter().any(|d| !d.kind.repairable())
    }
}

/// Validate a tree's structure: header bounds, leaf-chain linkage, record
/// counts, and strict ascending key order under `compare` (which orders two
/// raw records by key). Never writes; repairs are the caller's decision.
pub fn validate<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    tree: &BTree,
    compare: &dyn Fn(&[u8], &[u8]) -> Ordering,
) -> Result<TreeCheck> {
    let mut check = TreeCheck::default();
    let h = &tree.header;

    // The fork bounds how many nodes can exist; a header claiming more is
    // lying and would otherwise drive oversized allocations below.
    let plausible = (tree.fork.total_bytes() / h.node_size as u64) as u32;
    if h.total_nodes > plausible {
        check_push(&mut check, 0, None, DefectKind::HeaderBounds, format!(
            "total nodes {} exceeds the {} the fork can hold",
            h.total_nodes, plausible
        ));
        return Ok(check);
    }

    let mut bounds = |field: &str, value: u32| {
        if value >= h.total_nodes && value != 0 {
            check_push(&mut check, 0, None, DefectKind::HeaderBounds, format!(
                "{} {} >= total nodes {}",
                field, value, h.total_nodes
            ));
        }
    };
    bounds("root node", h.root_node);
    bounds("first leaf node", h.first_leaf_node);
    bounds("last leaf node", h.last_leaf_node);
    if h.free_nodes > h.total_nodes {
        check_push(&mut check, 0, None, DefectKind::HeaderBounds, format!(
            "free nodes {} > total nodes {}",
            h.free_nodes, h.total_nodes
        ));
    }

    // An empty tree is legal only in the all-zero configuration.
    if h.first_leaf_node == 0 || h.root_node == 0 {
        if h.root_node != 0 || h.first_leaf_node != 0 || h.last_leaf_node != 0
            || h.leaf_records != 0 || h.tree_depth != 0
        {
            check_push(&mut check, 0, None, DefectKind::HeaderBounds,
                "tree is partially empty: root, leaf links, depth and record count must all be zero".into());
        }
        return Ok(check);
    }
    if h.tree_depth == 0 {
        check_push(&mut check, 0, None, DefectKind::HeaderBounds,
            "tree depth 0 with a non-empty tree".into());
        return Ok(check);
    }

    let max_records = h.max_records_per_node();
    let mut visited = Bitmap::new(h.total_nodes);
    let mut current = h.first_leaf_node;
    let mut previous = 0u32;
    let mut last_key: Option<Vec<u8>> = None;

    while current != 0 {
        if current >= h.total_nodes {
            check_push(&mut check, current, None, DefectKind::HeaderBounds,
                format!("leaf chain points at node {} beyond the tree", current));
            break;
        }
        if visited.claim(current) {
            check_push(&mut check, current, None, DefectKind::Cycle,
                format!("node {} revisited in the leaf chain", current));
            break;
        }

        let raw = tree.read_node_raw(dev, current)?;
        let desc = NodeDescriptor::decode(&raw)?;

        if desc.kind != NODE_LEAF {
            check_push(&mut check, current, None, DefectKind::NodeKind,
                format!("kind {} in leaf chain", desc.kind));
        }
        if desc.num_records > max_records {
            check_push(&mut check, current, None, DefectKind::RecordCount,
                format!("{} records exceeds the {} a node can hold", desc.num_records, max_records));
            // Records are unreadable past this point; keep following the chain.
            previous = current;
            current = desc.forward_link;
            continue;
        }

        if desc.backward_link != previous {
            check.defects.push(Defect {
                node: current,
                record: None,
                kind: DefectKind::BackLink,
                detail: format!("backward link {} should be {}", desc.backward_link, previous),
                hint: Some(previous),
            });
        }

        match Node::parse(current, raw) {
            Ok(node) => {
                check.leaf_nodes += 1;
                for i in 0..node.desc.num_records as usize {
                    let record = match node.record(i) {
                        Ok(r) => r,
                        Err(e) => {
                            check_push(&mut check, current, Some(i as u16), DefectKind::OffsetTable,
                                e.to_string());
                            break;
                        }
                    };
                    check.leaf_records += 1;
                    if let Some(prev) = &last_key {
                        match compare(prev, record) {
                            Ordering::Less => {}
                            Ordering::Equal => {
                                check_push(&mut check, current, Some(i as u16), DefectKind::DuplicateKey,
                                    "duplicate key".into());
                            }
                            Ordering::Greater => {
                                check_push(&mut check, current, Some(i as u16), DefectKind::KeyOrder,
                                    "key out of order".into());
                            }
                        }
                    }
                    last_key = Some(record.to_vec());
                }
            }
            Err(e) => {
                check_push(&mut check, current, None, DefectKind::OffsetTable, e.to_string());
            }
        }

        if desc.forward_link == 0 && current != h.last_leaf_node {
            check_push(&mut check, current, None, DefectKind::ChainEnd,
                format!("chain ends at node {} but last leaf is {}", current, h.last_leaf_node));
        }
        if desc.forward_link != 0 && current == h.last_leaf_node {
            check_push(&mut check, current, None, DefectKind::ChainEnd,
                format!("last leaf {} still links forward to {}", current, desc.forward_link));
        }
        previous = current;
        current = desc.forward_link;
    }

    if check.leaf_records != h.leaf_records as u64 {
        let detail = format!("header claims {} leaf records, walk found {}", h.leaf_records, check.leaf_records);
        check_push(&mut check, 0, None, DefectKind::LeafCount, detail);
    }

    Ok(check)
}

fn check_push(check: &mut TreeCheck, node: u32, record: Option<u16>, kind: DefectKind, detail: String) {
    check.defects.push(Defect { node, record, kind, detail, hint: None });
}

/// Single-node repair: rewrite a broken descriptor in place. `kind` becomes
/// leaf when the node sits in the leaf chain, index otherwise; an oversized
/// `num_records` is clamped. Records themselves are never invented.
pub fn repair_node_descriptor<D: Read + Write + Seek>(
    dev: &mut BlockDevice<D>,
    tree: &BTree,
    index: u32,
    in_leaf_chain: bool,
) -> Result<()> {
    let mut raw = tree.read_node_raw(dev, index)?;
    let mut desc = NodeDescriptor::decode(&raw)?;
    desc.kind = if in_leaf_chain { NODE_LEAF } else { NODE_INDEX };
    desc.height = if in_leaf_chain { 1 } else { desc.height.max(2) };
    desc.num_records = desc.num_records.min(tree.header.max_records_per_node());
    desc.encode(&mut raw[..NODE_DESCRIPTOR_SIZE]);
    tree.write_node_raw(dev, index, &raw)
}

// ── Node builders (used by the formatter) ────────────────────────────────

/// Build a complete header node: descriptor, header record, 128-byte user
/// data record, and a map record with the given node indices marked used.
pub fn build_header_node(header: &HeaderRecord, map_used: &[u32]) -> Vec<u8> {
    let node_size = header.node_size as usize;
    let mut data = vec![0u8; node_size];

    let desc = NodeDescriptor {
        forward_link: 0,
        backward_link: 0,
        kind: NODE_HEADER,
        height: 0,
        num_records: 3,
        reserved: 0,
    };
    desc.encode(&mut data[..NODE_DESCRIPTOR_SIZE]);
    header.encode(&mut data[NODE_DESCRIPTOR_SIZE..NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE]);

    // Map record spans from past the user-data record to the offset table.
    let map_start = NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE + USER_DATA_RECORD_SIZE;
    let map_end = node_size - 8;
    for &node in map_used {
        let byte = map_start + node as usize / 8;
        if byte < map_end {
            data[byte] |= 0x80 >> (node % 8);
        }
    }

    let offsets = [
        NODE_DESCRIPTOR_SIZE as u16,
        (NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE) as u16,
        map_start as u16,
        map_end as u16,
    ];
    for (i, off) in offsets.iter().enumerate() {
        BigEndian::write_u16(&mut data[node_size - 2 * (i + 1)..], *off);
    }
    data
}

/// Build a leaf node from pre-encoded records (key + payload each).
pub fn build_leaf_node(
    node_size: usize,
    forward_link: u32,
    backward_link: u32,
    records: &[Vec<u8>],
) -> Vec<u8> {
    let mut data = vec![0u8; node_size];
    let desc = NodeDescriptor {
        forward_link,
        backward_link,
        kind: NODE_LEAF,
        height: 1,
        num_records: records.len() as u16,
        reserved: 0,
    };
    desc.encode(&mut data[..NODE_DESCRIPTOR_SIZE]);

    let mut pos = NODE_DESCRIPTOR_SIZE;
    let mut offsets = Vec::with_capacity(records.len() + 1);
    for record in records {
        offsets.push(pos as u16);
        data[pos..pos + record.len()].copy_from_slice(record);
        pos += record.len();
    }
    offsets.push(pos as u16);
    for (i, off) in offsets.iter().enumerate() {
        BigEndian::write_u16(&mut data[node_size - 2 * (i + 1)..], *off);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_node_descriptor_roundtrip() {
        let desc = NodeDescriptor {
            forward_link: 9,
            backward_link: 7,
            kind: NODE_LEAF,
            height: 1,
            num_records: 3,
            reserved: 0,
        };
        let mut buf = [0u8; NODE_DESCRIPTOR_SIZE];
        desc.encode(&mut buf);
        assert_eq!(NodeDescriptor::decode(&buf).unwrap(), desc);
    }

    #[test]
    fn test_header_record_roundtrip() {
        let header = HeaderRecord {
            tree_depth: 1,
            root_node: 1,
            leaf_records: 2,
            first_leaf_node: 1,
            last_leaf_node: 1,
            node_size: 4096,
            max_key_length: 516,
            total_nodes: 4,
            free_nodes: 2,
            clump_size: 16_384,
            tree_type: TREE_TYPE_CATALOG,
            key_compare_type: KEY_COMPARE_CASE_FOLD,
            attributes: 6,
        };
        let mut buf = [0u8; HEADER_RECORD_SIZE];
        header.encode(&mut buf);
        assert_eq!(HeaderRecord::decode(&buf).unwrap(), header);
    }

    fn record(key: u16, payload: &[u8]) -> Vec<u8> {
        // Minimal keyed record: [keyLength=2][key u16][payload]
        let mut r = vec![0, 2];
        r.extend_from_slice(&key.to_be_bytes());
        r.extend_from_slice(payload);
        r
    }

    fn key_of(r: &[u8]) -> u16 {
        BigEndian::read_u16(&r[2..])
    }

    #[test]
    fn test_build_and_parse_leaf() {
        let records = vec![record(1, b"aa"), record(2, b"bbbb"), record(5, b"c")];
        let data = build_leaf_node(512, 0, 0, &records);
        let node = Node::parse(1, data).unwrap();
        assert_eq!(node.desc.num_records, 3);
        assert_eq!(node.record(0).unwrap(), &records[0][..]);
        assert_eq!(node.record(2).unwrap(), &records[2][..]);
    }

    #[test]
    fn test_leaf_insert_preserves_order() {
        let data = build_leaf_node(512, 0, 0, &[record(1, b"aa"), record(5, b"c")]);
        let mut node = Node::parse(1, data).unwrap();
        node.insert_record(1, &record(3, b"mid")).unwrap();
        assert_eq!(node.desc.num_records, 3);
        assert_eq!(key_of(node.record(0).unwrap()), 1);
        assert_eq!(key_of(node.record(1).unwrap()), 3);
        assert_eq!(key_of(node.record(2).unwrap()), 5);

        // The node must survive a serialization round trip.
        let reparsed = Node::parse(1, node.data.clone()).unwrap();
        assert_eq!(reparsed.desc.num_records, 3);
        assert_eq!(key_of(reparsed.record(1).unwrap()), 3);
    }

    #[test]
    fn test_leaf_remove() {
        let data = build_leaf_node(
            512,
            0,
            0,
            &[record(1, b"aa"), record(3, b"bb"), record(5, b"cc")],
        );
        let mut node = Node::parse(1, data).unwrap();
        node.remove_record(1).unwrap();
        assert_eq!(node.desc.num_records, 2);
        assert_eq!(key_of(node.record(0).unwrap()), 1);
        assert_eq!(key_of(node.record(1).unwrap()), 5);
    }

    #[test]
    fn test_insert_refuses_when_full() {
        let data = build_leaf_node(64, 0, 0, &[record(1, &[0u8; 30])]);
        let mut node = Node::parse(1, data).unwrap();
        assert!(node.insert_record(1, &record(2, &[0u8; 30])).is_err());
    }

    #[test]
    fn test_header_node_map_bits() {
        let header = HeaderRecord {
            tree_depth: 1,
            root_node: 1,
            leaf_records: 1,
            first_leaf_node: 1,
            last_leaf_node: 1,
            node_size: 512,
            max_key_length: 37,
            total_nodes: 4,
            free_nodes: 2,
            clump_size: 2048,
            tree_type: TREE_TYPE_CATALOG,
            key_compare_type: 0,
            attributes: 0,
        };
        let data = build_header_node(&header, &[0, 1]);
        let map_start = NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE + USER_DATA_RECORD_SIZE;
        assert_eq!(data[map_start], 0xC0);

        let node = Node::parse(0, data).unwrap();
        assert_eq!(node.desc.kind, NODE_HEADER);
        assert_eq!(node.desc.num_records, 3);
        let rec0 = node.record(0).unwrap();
        assert_eq!(HeaderRecord::decode(rec0).unwrap(), header);
    }

    fn compare_u16_keys(a: &[u8], b: &[u8]) -> Ordering {
        BigEndian::read_u16(&a[2..]).cmp(&BigEndian::read_u16(&b[2..]))
    }

    /// Assemble a tree image from raw 512-byte nodes and open it.
    fn open_tree(nodes: Vec<Vec<u8>>) -> (BlockDevice<Cursor<Vec<u8>>>, BTree) {
        let mut image = Vec::new();
        for node in &nodes {
            assert_eq!(node.len(), 512);
            image.extend_from_slice(node);
        }
        let len = image.len() as u64;
        let mut dev = BlockDevice::new(Cursor::new(image)).unwrap();
        let tree = BTree::open(&mut dev, ForkMap::from_range(0, len)).unwrap();
        (dev, tree)
    }

    fn two_leaf_header(leaf_records: u32) -> HeaderRecord {
        HeaderRecord {
            tree_depth: 1,
            root_node: 1,
            leaf_records,
            first_leaf_node: 1,
            last_leaf_node: 2,
            node_size: 512,
            max_key_length: 6,
            total_nodes: 3,
            free_nodes: 0,
            clump_size: 2048,
            tree_type: TREE_TYPE_CATALOG,
            key_compare_type: 0,
            attributes: 0,
        }
    }

    #[test]
    fn test_validate_clean_two_leaf_chain() {
        let (mut dev, tree) = open_tree(vec![
            build_header_node(&two_leaf_header(4), &[0, 1, 2]),
            build_leaf_node(512, 2, 0, &[record(1, b"a"), record(2, b"b")]),
            build_leaf_node(512, 0, 1, &[record(3, b"c"), record(4, b"d")]),
        ]);
        let check = validate(&mut dev, &tree, &compare_u16_keys).unwrap();
        assert!(check.is_clean(), "defects: {:?}", check.defects);
        assert_eq!(check.leaf_nodes, 2);
        assert_eq!(check.leaf_records, 4);
    }

    #[test]
    fn test_validate_detects_cycle() {
        // Node 2 links back to node 1.
        let (mut dev, tree) = open_tree(vec![
            build_header_node(&two_leaf_header(4), &[0, 1, 2]),
            build_leaf_node(512, 2, 0, &[record(1, b"a"), record(2, b"b")]),
            build_leaf_node(512, 1, 1, &[record(3, b"c"), record(4, b"d")]),
        ]);
        let check = validate(&mut dev, &tree, &compare_u16_keys).unwrap();
        assert!(check.defects.iter().any(|d| d.kind == DefectKind::Cycle));
    }

    #[test]
    fn test_validate_detects_duplicate_across_nodes() {
        let (mut dev, tree) = open_tree(vec![
            build_header_node(&two_leaf_header(4), &[0, 1, 2]),
            build_leaf_node(512, 2, 0, &[record(1, b"a"), record(2, b"b")]),
            build_leaf_node(512, 0, 1, &[record(2, b"dup"), record(4, b"d")]),
        ]);
        let check = validate(&mut dev, &tree, &compare_u16_keys).unwrap();
        let dup = check
            .defects
            .iter()
            .find(|d| d.kind == DefectKind::DuplicateKey)
            .expect("duplicate not detected");
        assert_eq!(dup.node, 2);
        assert_eq!(dup.record, Some(0));
    }

    #[test]
    fn test_validate_detects_descending_keys() {
        let (mut dev, tree) = open_tree(vec![
            build_header_node(&two_leaf_header(4), &[0, 1, 2]),
            build_leaf_node(512, 2, 0, &[record(5, b"a"), record(6, b"b")]),
            build_leaf_node(512, 0, 1, &[record(3, b"late"), record(9, b"d")]),
        ]);
        let check = validate(&mut dev, &tree, &compare_u16_keys).unwrap();
        assert!(check.defects.iter().any(|d| d.kind == DefectKind::KeyOrder));
        assert!(check.has_critical());
    }

    #[test]
    fn test_validate_flags_bad_leaf_count_and_chain_end() {
        // Header claims 9 records and a last leaf the chain never reaches.
        let mut header = two_leaf_header(9);
        header.last_leaf_node = 2;
        let (mut dev, tree) = open_tree(vec![
            build_header_node(&header, &[0, 1, 2]),
            build_leaf_node(512, 0, 0, &[record(1, b"a")]),
            build_leaf_node(512, 0, 1, &[record(3, b"c")]),
        ]);
        let check = validate(&mut dev, &tree, &compare_u16_keys).unwrap();
        assert!(check.defects.iter().any(|d| d.kind == DefectKind::ChainEnd));
        assert!(check.defects.iter().any(|d| d.kind == DefectKind::LeafCount));
    }

    fn index_record(key: u16, child: u32) -> Vec<u8> {
        let mut r = record(key, &[]);
        r.extend_from_slice(&child.to_be_bytes());
        r
    }

    #[test]
    fn test_search_descends_through_index_node() {
        // Root index node 3 over leaves 1 and 2.
        let mut header = two_leaf_header(4);
        header.tree_depth = 2;
        header.root_node = 3;
        header.total_nodes = 4;

        let mut index = build_leaf_node(
            512,
            0,
            0,
            &[index_record(1, 1), index_record(3, 2)],
        );
        // Rewrite the descriptor: this node is an index node, height 2.
        let desc = NodeDescriptor {
            forward_link: 0,
            backward_link: 0,
            kind: NODE_INDEX,
            height: 2,
            num_records: 2,
            reserved: 0,
        };
        desc.encode(&mut index[..NODE_DESCRIPTOR_SIZE]);

        let (mut dev, tree) = open_tree(vec![
            build_header_node(&header, &[0, 1, 2, 3]),
            build_leaf_node(512, 2, 0, &[record(1, b"a"), record(2, b"b")]),
            build_leaf_node(512, 0, 1, &[record(3, b"c"), record(4, b"d")]),
            index,
        ]);

        let target = record(4, b"");
        let hit = tree
            .search(&mut dev, &|r| compare_u16_keys(r, &target))
            .unwrap()
            .expect("key 4 should be found");
        assert_eq!(hit.0.index, 2);
        assert_eq!(key_of(hit.0.record(hit.1).unwrap()), 4);

        let miss_target = record(7, b"");
        assert!(tree
            .search(&mut dev, &|r| compare_u16_keys(r, &miss_target))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_walk_leaves_visits_everything_in_order() {
        let (mut dev, tree) = open_tree(vec![
            build_header_node(&two_leaf_header(4), &[0, 1, 2]),
            build_leaf_node(512, 2, 0, &[record(1, b"a"), record(2, b"b")]),
            build_leaf_node(512, 0, 1, &[record(3, b"c"), record(4, b"d")]),
        ]);
        let mut keys = Vec::new();
        tree.walk_leaves(&mut dev, |_, _, r| {
            keys.push(key_of(r));
            Ok(true)
        })
        .unwrap();
        assert_eq!(keys, vec![1, 2, 3, 4]);
    }
}
