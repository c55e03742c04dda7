//! Page-resident B+-tree mapping row ids to version chain heads
//!
//! Leaf page payload:
//! ```text
//! count u16 | next_leaf u64 | (row_id [18] | head link [10]) * count
//! ```
//! Inner page payload:
//! ```text
//! count u16 | child0 u64 | (separator row_id [18] | child u64) * count
//! ```
//! Child `i` holds keys in `[separator[i-1], separator[i])`. Nodes split
//! when they overflow; deletes never merge, so underfull leaves stay linked.

use crate::chain::{LINK_SIZE, Link};
use crate::meta::StoreMeta;
use crate::page::{Page, PageType};
use crate::pager::Pager;
use bytes::{Buf, BufMut};
use pagoda_common::{PageId, ROW_ID_SIZE, Result, RowId, StorageFault};

const NODE_HEADER: usize = 10;
const LEAF_ENTRY: usize = ROW_ID_SIZE + LINK_SIZE;
const INNER_ENTRY: usize = ROW_ID_SIZE + 8;
const MAX_DEPTH: usize = 32;

struct LeafNode {
    entries: Vec<(RowId, Link)>,
    next: PageId,
}

struct InnerNode {
    keys: Vec<RowId>,
    children: Vec<PageId>,
}

enum Node {
    Leaf(LeafNode),
    Inner(InnerNode),
}

fn get_row_id(buf: &mut &[u8]) -> RowId {
    let mut raw = [0u8; ROW_ID_SIZE];
    buf.copy_to_slice(&mut raw);
    RowId::from_bytes(&raw)
}

const fn leaf_capacity(payload: usize) -> usize {
    (payload - NODE_HEADER) / LEAF_ENTRY
}

const fn inner_capacity(payload: usize) -> usize {
    (payload - NODE_HEADER) / INNER_ENTRY
}

impl Node {
    fn read(pager: &Pager, id: PageId) -> Result<Self> {
        let page = pager.load(id)?;
        let mut buf = page.payload();
        let count = buf.get_u16_le() as usize;
        match page.page_type() {
            PageType::BTreeLeaf => {
                if count > leaf_capacity(pager.payload_size()) {
                    return Err(StorageFault::corruption(id, format!("leaf claims {count} entries")));
                }
                let next = PageId::new(buf.get_u64_le());
                let mut entries = Vec::with_capacity(count + 1);
                for _ in 0..count {
                    let key = get_row_id(&mut buf);
                    entries.push((key, Link::decode(&mut buf)));
                }
                Ok(Self::Leaf(LeafNode { entries, next }))
            }
            PageType::BTreeInner => {
                if count == 0 || count > inner_capacity(pager.payload_size()) {
                    return Err(StorageFault::corruption(
                        id,
                        format!("inner node claims {count} keys"),
                    ));
                }
                let mut children = Vec::with_capacity(count + 2);
                let mut keys = Vec::with_capacity(count + 1);
                children.push(PageId::new(buf.get_u64_le()));
                for _ in 0..count {
                    keys.push(get_row_id(&mut buf));
                    children.push(PageId::new(buf.get_u64_le()));
                }
                Ok(Self::Inner(InnerNode { keys, children }))
            }
            other => Err(StorageFault::corruption(
                id,
                format!("expected a B+-tree page, found {other:?}"),
            )),
        }
    }

    fn write(&self, pager: &Pager, id: PageId) -> Result<()> {
        let page = match self {
            Self::Leaf(leaf) => {
                let mut page = Page::new(id, PageType::BTreeLeaf, pager.page_size());
                let mut buf = page.payload_mut();
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u16_le(leaf.entries.len() as u16);
                buf.put_u64_le(leaf.next.as_u64());
                for (key, link) in &leaf.entries {
                    buf.put_slice(&key.to_bytes());
                    link.encode(&mut buf);
                }
                page
            }
            Self::Inner(inner) => {
                let mut page = Page::new(id, PageType::BTreeInner, pager.page_size());
                let mut buf = page.payload_mut();
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u16_le(inner.keys.len() as u16);
                buf.put_u64_le(inner.children[0].as_u64());
                for (key, child) in inner.keys.iter().zip(&inner.children[1..]) {
                    buf.put_slice(&key.to_bytes());
                    buf.put_u64_le(child.as_u64());
                }
                page
            }
        };
        pager.save(page)
    }
}

impl InnerNode {
    fn child_for(&self, key: &RowId) -> usize {
        self.keys.partition_point(|k| k <= key)
    }
}

/// Write an empty root leaf
pub(crate) fn init(pager: &Pager, root: PageId) -> Result<()> {
    Node::Leaf(LeafNode {
        entries: Vec::new(),
        next: PageId::NONE,
    })
    .write(pager, root)
}

/// Descend to the leaf that would contain `key`
fn find_leaf(pager: &Pager, root: PageId, key: &RowId) -> Result<(PageId, LeafNode)> {
    let mut id = root;
    for _ in 0..MAX_DEPTH {
        match Node::read(pager, id)? {
            Node::Leaf(leaf) => return Ok((id, leaf)),
            Node::Inner(inner) => id = inner.children[inner.child_for(key)],
        }
    }
    Err(StorageFault::corruption(root, "B+-tree deeper than supported"))
}

/// Head link of `key`
pub(crate) fn find(pager: &Pager, root: PageId, key: &RowId) -> Result<Option<Link>> {
    let (_, leaf) = find_leaf(pager, root, key)?;
    Ok(leaf
        .entries
        .binary_search_by(|(k, _)| k.cmp(key))
        .ok()
        .map(|pos| leaf.entries[pos].1))
}

/// Insert or update `key`, returning the previous link
pub(crate) fn upsert(
    pager: &Pager,
    meta: &mut StoreMeta,
    key: RowId,
    link: Link,
) -> Result<Option<Link>> {
    let root = meta.root;
    let (previous, split) = insert_into(pager, meta, root, key, link, 0)?;

    if let Some((separator, right)) = split {
        let new_root = pager.allocate(meta, PageType::BTreeInner)?;
        let new_root_id = new_root.id();
        Node::Inner(InnerNode {
            keys: vec![separator],
            children: vec![root, right],
        })
        .write(pager, new_root_id)?;
        meta.root = new_root_id;
        meta.tree_height += 1;
    }

    Ok(previous)
}

type Split = Option<(RowId, PageId)>;

fn insert_into(
    pager: &Pager,
    meta: &mut StoreMeta,
    id: PageId,
    key: RowId,
    link: Link,
    depth: usize,
) -> Result<(Option<Link>, Split)> {
    if depth >= MAX_DEPTH {
        return Err(StorageFault::corruption(id, "B+-tree deeper than supported"));
    }

    match Node::read(pager, id)? {
        Node::Leaf(mut leaf) => {
            match leaf.entries.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(pos) => {
                    let previous = std::mem::replace(&mut leaf.entries[pos].1, link);
                    Node::Leaf(leaf).write(pager, id)?;
                    return Ok((Some(previous), None));
                }
                Err(pos) => leaf.entries.insert(pos, (key, link)),
            }

            if leaf.entries.len() <= leaf_capacity(pager.payload_size()) {
                Node::Leaf(leaf).write(pager, id)?;
                return Ok((None, None));
            }

            let right_entries = leaf.entries.split_off(leaf.entries.len() / 2);
            let right_id = pager.allocate(meta, PageType::BTreeLeaf)?.id();
            let separator = right_entries[0].0;
            let right = LeafNode {
                entries: right_entries,
                next: leaf.next,
            };
            leaf.next = right_id;
            Node::Leaf(right).write(pager, right_id)?;
            Node::Leaf(leaf).write(pager, id)?;
            Ok((None, Some((separator, right_id))))
        }
        Node::Inner(mut inner) => {
            let idx = inner.child_for(&key);
            let (previous, split) =
                insert_into(pager, meta, inner.children[idx], key, link, depth + 1)?;

            let Some((separator, new_child)) = split else {
                return Ok((previous, None));
            };

            inner.keys.insert(idx, separator);
            inner.children.insert(idx + 1, new_child);

            if inner.keys.len() <= inner_capacity(pager.payload_size()) {
                Node::Inner(inner).write(pager, id)?;
                return Ok((previous, None));
            }

            let mid = inner.keys.len() / 2;
            let up = inner.keys[mid];
            let right_keys = inner.keys.split_off(mid + 1);
            inner.keys.truncate(mid);
            let right_children = inner.children.split_off(mid + 1);
            let right_id = pager.allocate(meta, PageType::BTreeInner)?.id();
            Node::Inner(InnerNode {
                keys: right_keys,
                children: right_children,
            })
            .write(pager, right_id)?;
            Node::Inner(inner).write(pager, id)?;
            Ok((previous, Some((up, right_id))))
        }
    }
}

/// Remove `key`, returning its link
pub(crate) fn remove(pager: &Pager, root: PageId, key: &RowId) -> Result<Option<Link>> {
    let (id, mut leaf) = find_leaf(pager, root, key)?;
    match leaf.entries.binary_search_by(|(k, _)| k.cmp(key)) {
        Ok(pos) => {
            let (_, link) = leaf.entries.remove(pos);
            Node::Leaf(leaf).write(pager, id)?;
            Ok(Some(link))
        }
        Err(_) => Ok(None),
    }
}

/// Up to `limit` entries with keys `>= from`, in key order
pub(crate) fn scan(
    pager: &Pager,
    root: PageId,
    from: &RowId,
    limit: usize,
) -> Result<Vec<(RowId, Link)>> {
    let mut out = Vec::with_capacity(limit.min(1024));
    if limit == 0 {
        return Ok(out);
    }

    let (_, mut leaf) = find_leaf(pager, root, from)?;
    let start = leaf.entries.partition_point(|(k, _)| k < from);
    let mut entries = leaf.entries.split_off(start);

    loop {
        for entry in entries {
            out.push(entry);
            if out.len() == limit {
                return Ok(out);
            }
        }
        if leaf.next.is_none() {
            return Ok(out);
        }
        let next = leaf.next;
        leaf = match Node::read(pager, next)? {
            Node::Leaf(leaf) => leaf,
            Node::Inner(_) => {
                return Err(StorageFault::corruption(next, "leaf chain points at inner node"));
            }
        };
        entries = std::mem::take(&mut leaf.entries);
    }
}
