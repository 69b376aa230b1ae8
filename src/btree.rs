use std::sync::Arc;

use crate::constants::{MAX_ENTRY_SIZE, PAGE_CAPACITY, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::Stat;
use crate::page::{Node, PageId};

/// Page access seam between the tree and the transaction overlays.
///
/// The tree never touches the file or the arena directly; `update` is the
/// copy-on-write point, returning the id that now holds the modified node
/// (the same id when it was already private to the writer, a fresh one when
/// the original must stay visible to older snapshots).
pub(crate) trait NodeStore {
    fn load(&mut self, id: PageId) -> Result<Arc<Node>>;
    fn update(&mut self, id: PageId, node: Node) -> Result<PageId>;
    fn alloc(&mut self, node: Node) -> Result<PageId>;
    fn retire(&mut self, id: PageId) -> Result<()>;
}

/// Index of the child a key routes to: the last child whose separator is
/// `<=` the key. Keys below every separator route to the first child.
pub(crate) fn child_index(entries: &[(Vec<u8>, PageId)], key: &[u8]) -> usize {
    match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    }
}

pub(crate) fn lookup<S: NodeStore>(
    store: &mut S,
    root: Option<PageId>,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let Some(mut pid) = root else {
        return Ok(None);
    };
    loop {
        let node = store.load(pid)?;
        match &*node {
            Node::Leaf(entries) => {
                return Ok(entries
                    .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                    .ok()
                    .map(|i| entries[i].1.clone()));
            }
            Node::Branch(entries) => {
                pid = entries[child_index(entries, key)].1;
            }
        }
    }
}

enum Ins {
    Plain(PageId),
    Split(PageId, Vec<u8>, PageId),
}

/// Insert or overwrite a pair, copy-on-write along the root-to-leaf path.
/// Returns the new root. Presence checks (NOOVERWRITE, duplicate policy)
/// happen in the transaction layer before any page is touched.
pub(crate) fn insert<S: NodeStore>(
    store: &mut S,
    root: Option<PageId>,
    key: &[u8],
    value: &[u8],
) -> Result<PageId> {
    if Node::entry_len(key, value) > MAX_ENTRY_SIZE {
        return Err(Error::BadValSize);
    }
    match root {
        None => store.alloc(Node::Leaf(vec![(key.to_vec(), value.to_vec())])),
        Some(pid) => match insert_rec(store, pid, key, value)? {
            Ins::Plain(p) => Ok(p),
            Ins::Split(left, sep, right) => {
                // empty separator is a lower bound for everything
                store.alloc(Node::Branch(vec![(Vec::new(), left), (sep, right)]))
            }
        },
    }
}

fn insert_rec<S: NodeStore>(
    store: &mut S,
    pid: PageId,
    key: &[u8],
    value: &[u8],
) -> Result<Ins> {
    let node = store.load(pid)?;
    match &*node {
        Node::Leaf(entries) => {
            let mut entries = entries.clone();
            match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                Ok(i) => entries[i].1 = value.to_vec(),
                Err(i) => entries.insert(i, (key.to_vec(), value.to_vec())),
            }
            finish_node(store, pid, Node::Leaf(entries))
        }
        Node::Branch(entries) => {
            let idx = child_index(entries, key);
            let child = entries[idx].1;
            let mut entries = entries.clone();
            match insert_rec(store, child, key, value)? {
                Ins::Plain(p) => entries[idx].1 = p,
                Ins::Split(left, sep, right) => {
                    entries[idx].1 = left;
                    entries.insert(idx + 1, (sep, right));
                }
            }
            finish_node(store, pid, Node::Branch(entries))
        }
    }
}

fn finish_node<S: NodeStore>(store: &mut S, pid: PageId, node: Node) -> Result<Ins> {
    if node.encoded_len() <= PAGE_CAPACITY {
        return Ok(Ins::Plain(store.update(pid, node)?));
    }
    let (left, sep, right) = split(node);
    let left_id = store.update(pid, left)?;
    let right_id = store.alloc(right)?;
    Ok(Ins::Split(left_id, sep, right_id))
}

/// Split an overfull node at the smallest cut where the left half reaches
/// half the encoded size. Entry sizes are capped at half a page, so both
/// halves always fit.
fn split(node: Node) -> (Node, Vec<u8>, Node) {
    match node {
        Node::Leaf(mut entries) => {
            let cut = split_point(entries.iter().map(|(k, v)| 6 + k.len() + v.len()), entries.len());
            let right = entries.split_off(cut);
            let sep = right[0].0.clone();
            (Node::Leaf(entries), sep, Node::Leaf(right))
        }
        Node::Branch(mut entries) => {
            let cut = split_point(entries.iter().map(|(k, _)| 10 + k.len()), entries.len());
            let right = entries.split_off(cut);
            let sep = right[0].0.clone();
            (Node::Branch(entries), sep, Node::Branch(right))
        }
    }
}

fn split_point(sizes: impl Iterator<Item = usize> + Clone, len: usize) -> usize {
    let total: usize = sizes.clone().sum();
    let mut acc = 0;
    for (i, size) in sizes.enumerate() {
        acc += size;
        if acc * 2 >= total {
            return (i + 1).clamp(1, len - 1);
        }
    }
    len - 1
}

/// Remove a key, copy-on-write along the path. Returns the new root (`None`
/// when the tree became empty) and the removed value. `NotFound` propagates
/// before any page is modified, leaving the overlay untouched.
pub(crate) fn delete<S: NodeStore>(
    store: &mut S,
    root: Option<PageId>,
    key: &[u8],
) -> Result<(Option<PageId>, Vec<u8>)> {
    match root {
        None => Err(Error::NotFound),
        Some(pid) => delete_rec(store, pid, key),
    }
}

fn delete_rec<S: NodeStore>(
    store: &mut S,
    pid: PageId,
    key: &[u8],
) -> Result<(Option<PageId>, Vec<u8>)> {
    let node = store.load(pid)?;
    match &*node {
        Node::Leaf(entries) => {
            let i = entries
                .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                .map_err(|_| Error::NotFound)?;
            let mut entries = entries.clone();
            let (_, old) = entries.remove(i);
            if entries.is_empty() {
                store.retire(pid)?;
                Ok((None, old))
            } else {
                Ok((Some(store.update(pid, Node::Leaf(entries))?), old))
            }
        }
        Node::Branch(entries) => {
            let idx = child_index(entries, key);
            let child = entries[idx].1;
            let mut entries = entries.clone();
            let (new_child, old) = delete_rec(store, child, key)?;
            match new_child {
                Some(p) => {
                    entries[idx].1 = p;
                    merge_if_small(store, &mut entries, idx)?;
                }
                None => {
                    entries.remove(idx);
                }
            }
            match entries.len() {
                0 => {
                    store.retire(pid)?;
                    Ok((None, old))
                }
                1 => {
                    let only = entries[0].1;
                    store.retire(pid)?;
                    Ok((Some(only), old))
                }
                _ => Ok((Some(store.update(pid, Node::Branch(entries))?), old)),
            }
        }
    }
}

/// Merge an underfull child into an adjacent sibling when the pair fits one
/// page. Merge-only rebalancing keeps the tree ordered without borrowing.
fn merge_if_small<S: NodeStore>(
    store: &mut S,
    entries: &mut Vec<(Vec<u8>, PageId)>,
    idx: usize,
) -> Result<()> {
    let child = store.load(entries[idx].1)?;
    if child.encoded_len() * 4 >= PAGE_CAPACITY || entries.len() < 2 {
        return Ok(());
    }
    let (li, ri) = if idx > 0 { (idx - 1, idx) } else { (idx, idx + 1) };
    let left = store.load(entries[li].1)?;
    let right = store.load(entries[ri].1)?;
    if left.encoded_len() + right.encoded_len() - 4 > PAGE_CAPACITY {
        return Ok(());
    }
    let merged = match (&*left, &*right) {
        (Node::Leaf(a), Node::Leaf(b)) => {
            let mut m = a.clone();
            m.extend(b.iter().cloned());
            Node::Leaf(m)
        }
        (Node::Branch(a), Node::Branch(b)) => {
            let mut m = a.clone();
            m.extend(b.iter().cloned());
            Node::Branch(m)
        }
        // siblings at one level never mix kinds
        _ => return Err(Error::Corrupted),
    };
    let right_id = entries[ri].1;
    entries[li].1 = store.update(entries[li].1, merged)?;
    store.retire(right_id)?;
    entries.remove(ri);
    Ok(())
}

/// Walk the tree gathering statistics. `weigh` maps one stored pair to its
/// logical entry count (duplicate-value lists weigh more than one).
pub(crate) fn tree_stat<S: NodeStore>(
    store: &mut S,
    root: Option<PageId>,
    mut weigh: impl FnMut(&[u8], &[u8]) -> usize,
) -> Result<Stat> {
    let mut stat = Stat {
        psize: PAGE_SIZE as u32,
        ..Stat::default()
    };
    let Some(root) = root else {
        return Ok(stat);
    };
    let mut stack = vec![(root, 1u32)];
    while let Some((pid, depth)) = stack.pop() {
        stat.depth = stat.depth.max(depth);
        let node = store.load(pid)?;
        match &*node {
            Node::Leaf(entries) => {
                stat.leaf_pages += 1;
                for (k, v) in entries {
                    stat.entries += weigh(k, v);
                }
            }
            Node::Branch(entries) => {
                stat.branch_pages += 1;
                for (_, child) in entries {
                    stack.push((*child, depth + 1));
                }
            }
        }
    }
    Ok(stat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory store that always moves updated nodes to a fresh id, so the
    /// tests exercise the copy-on-write path and page accounting.
    struct MemStore {
        nodes: HashMap<PageId, Arc<Node>>,
        next: PageId,
        retired: Vec<PageId>,
    }

    impl MemStore {
        fn new() -> Self {
            MemStore {
                nodes: HashMap::new(),
                next: 2,
                retired: Vec::new(),
            }
        }
    }

    impl NodeStore for MemStore {
        fn load(&mut self, id: PageId) -> Result<Arc<Node>> {
            self.nodes.get(&id).cloned().ok_or(Error::PageNotFound)
        }

        fn update(&mut self, id: PageId, node: Node) -> Result<PageId> {
            self.retire(id)?;
            self.alloc(node)
        }

        fn alloc(&mut self, node: Node) -> Result<PageId> {
            let id = self.next;
            self.next += 1;
            self.nodes.insert(id, Arc::new(node));
            Ok(id)
        }

        fn retire(&mut self, id: PageId) -> Result<()> {
            self.nodes.remove(&id).ok_or(Error::PageNotFound)?;
            self.retired.push(id);
            Ok(())
        }
    }

    fn collect(store: &mut MemStore, root: Option<PageId>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        let Some(root) = root else { return out };
        let mut stack = vec![root];
        while let Some(pid) = stack.pop() {
            match &*store.load(pid).unwrap() {
                Node::Leaf(entries) => out.extend(entries.iter().cloned()),
                Node::Branch(entries) => {
                    for (_, child) in entries.iter().rev() {
                        stack.push(*child);
                    }
                }
            }
        }
        out
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key-{i:06}").into_bytes()
    }

    fn val(i: u32) -> Vec<u8> {
        // large enough to force splits after a few dozen inserts
        format!("value-{i:06}-{}", "x".repeat(200)).into_bytes()
    }

    #[test]
    fn insert_lookup_many_with_splits() {
        let mut store = MemStore::new();
        let mut root = None;
        for i in 0..500 {
            root = Some(insert(&mut store, root, &key(i), &val(i)).unwrap());
        }
        let stat = tree_stat(&mut store, root, |_, _| 1).unwrap();
        assert_eq!(stat.entries, 500);
        assert!(stat.depth >= 2, "expected splits, depth={}", stat.depth);

        for i in (0..500).step_by(7) {
            assert_eq!(lookup(&mut store, root, &key(i)).unwrap(), Some(val(i)));
        }
        assert_eq!(lookup(&mut store, root, b"nope").unwrap(), None);
    }

    #[test]
    fn iteration_order_is_lexicographic() {
        let mut store = MemStore::new();
        let mut root = None;
        for i in [9u32, 3, 7, 1, 8, 2, 6, 0, 5, 4] {
            root = Some(insert(&mut store, root, &key(i), &val(i)).unwrap());
        }
        let pairs = collect(&mut store, root);
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn overwrite_replaces_value() {
        let mut store = MemStore::new();
        let mut root = None;
        root = Some(insert(&mut store, root, b"a", b"1").unwrap());
        root = Some(insert(&mut store, root, b"a", b"2").unwrap());
        assert_eq!(lookup(&mut store, root, b"a").unwrap(), Some(b"2".to_vec()));
        let stat = tree_stat(&mut store, root, |_, _| 1).unwrap();
        assert_eq!(stat.entries, 1);
    }

    #[test]
    fn delete_all_returns_empty_tree() {
        let mut store = MemStore::new();
        let mut root = None;
        for i in 0..200 {
            root = Some(insert(&mut store, root, &key(i), &val(i)).unwrap());
        }
        for i in 0..200 {
            let (new_root, old) = delete(&mut store, root, &key(i)).unwrap();
            assert_eq!(old, val(i));
            root = new_root;
        }
        assert_eq!(root, None);
        // every page allocated along the way was retired again
        assert!(store.nodes.is_empty());
    }

    #[test]
    fn delete_absent_leaves_tree_unchanged() {
        let mut store = MemStore::new();
        let mut root = None;
        for i in 0..50 {
            root = Some(insert(&mut store, root, &key(i), &val(i)).unwrap());
        }
        let before = collect(&mut store, root);
        let live_before = store.nodes.len();
        assert!(matches!(
            delete(&mut store, root, b"missing"),
            Err(Error::NotFound)
        ));
        assert_eq!(collect(&mut store, root), before);
        assert_eq!(store.nodes.len(), live_before);
    }

    #[test]
    fn merge_keeps_small_trees_shallow() {
        let mut store = MemStore::new();
        let mut root = None;
        for i in 0..300 {
            root = Some(insert(&mut store, root, &key(i), &val(i)).unwrap());
        }
        // shrink back down to a handful of entries
        for i in 5..300 {
            let (new_root, _) = delete(&mut store, root, &key(i)).unwrap();
            root = new_root;
        }
        let stat = tree_stat(&mut store, root, |_, _| 1).unwrap();
        assert_eq!(stat.entries, 5);
        assert_eq!(stat.depth, 1);
        assert_eq!(stat.branch_pages, 0);
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let mut store = MemStore::new();
        let huge = vec![0u8; MAX_ENTRY_SIZE];
        assert!(matches!(
            insert(&mut store, None, b"k", &huge),
            Err(Error::BadValSize)
        ));
    }
}
