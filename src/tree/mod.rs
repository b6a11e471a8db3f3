//! 持久化（copy-on-write）AVL 树，带顺序统计。
//!
//! - 节点用 `Arc` 共享：`clone()` 只复制根指针，写入时 `Arc::make_mut` 只复制
//!   被修改路径上的节点。旧版本树保持不变，游标可以一直持有它（快照语义）。
//! - 每个节点维护 `size`（子树节点数）和 `weight`（子树内值的权重和）。
//!   Table 把一个 key 下的重复值个数作为权重，于是“第 i 个 tuple”可以 O(log n) 定位。

use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::schema::Comparator;

/// 值在顺序统计里占的份量
pub trait Weigh {
    fn weight(&self) -> usize;
}

impl Weigh for () {
    fn weight(&self) -> usize {
        1
    }
}

type Link<K, V> = Option<Arc<Node<K, V>>>;

#[derive(Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    height: u32,
    size: usize,
    weight: usize,
    left: Link<K, V>,
    right: Link<K, V>,
}

impl<K, V: Weigh> Node<K, V> {
    fn leaf(key: K, value: V) -> Self {
        let weight = value.weight();
        Self {
            key,
            value,
            height: 1,
            size: 1,
            weight,
            left: None,
            right: None,
        }
    }

    fn value_weight(&self) -> usize {
        self.value.weight()
    }

    fn refresh(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
        self.size = 1 + size(&self.left) + size(&self.right);
        self.weight = self.value.weight() + weight(&self.left) + weight(&self.right);
    }
}

fn height<K, V>(link: &Link<K, V>) -> u32 {
    link.as_ref().map_or(0, |n| n.height)
}

fn size<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |n| n.size)
}

fn weight<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |n| n.weight)
}

fn balance_of<K, V>(link: &Link<K, V>) -> i64 {
    link.as_ref()
        .map_or(0, |n| height(&n.left) as i64 - height(&n.right) as i64)
}

/// `rank` 的结果：严格小于（或含等于）某个 key 的节点数与权重和
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rank {
    pub count: usize,
    pub weight: usize,
}

pub struct AvlTree<K, V> {
    root: Link<K, V>,
    cmp: Arc<dyn Comparator<K>>,
}

impl<K, V> Clone for AvlTree<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            cmp: self.cmp.clone(),
        }
    }
}

impl<K, V> AvlTree<K, V> {
    pub fn new(cmp: Arc<dyn Comparator<K>>) -> Self {
        Self { root: None, cmp }
    }

    pub fn comparator(&self) -> &Arc<dyn Comparator<K>> {
        &self.cmp
    }

    /// 节点（key）个数
    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// 全部值的权重和
    pub fn weight(&self) -> usize {
        weight(&self.root)
    }

    pub fn height(&self) -> u32 {
        height(&self.root)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut link = &self.root;
        while let Some(node) = link {
            match self.cmp.compare(key, &node.key) {
                Ordering::Less => link = &node.left,
                Ordering::Greater => link = &node.right,
                Ordering::Equal => return Some(&node.value),
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_deref()?;
        while let Some(l) = node.left.as_deref() {
            node = l;
        }
        Some((&node.key, &node.value))
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_deref()?;
        while let Some(r) = node.right.as_deref() {
            node = r;
        }
        Some((&node.key, &node.value))
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        let mut it = Iter { stack: Vec::new() };
        it.push_left(self.root.as_deref());
        it
    }
}

impl<K, V: Weigh> AvlTree<K, V> {
    /// 比 `key` 小（`inclusive` 时含等于）的节点数与权重
    pub fn rank(&self, key: &K, inclusive: bool) -> Rank {
        let mut r = Rank::default();
        let mut link = &self.root;
        while let Some(node) = link {
            match self.cmp.compare(key, &node.key) {
                Ordering::Less => link = &node.left,
                Ordering::Greater => {
                    r.count += size(&node.left) + 1;
                    r.weight += weight(&node.left) + node.value_weight();
                    link = &node.right;
                }
                Ordering::Equal => {
                    r.count += size(&node.left);
                    r.weight += weight(&node.left);
                    if inclusive {
                        r.count += 1;
                        r.weight += node.value_weight();
                    }
                    break;
                }
            }
        }
        r
    }

    /// 按中序下标取第 `index` 个节点
    pub fn select(&self, mut index: usize) -> Option<(&K, &V)> {
        let mut link = &self.root;
        while let Some(node) = link {
            let left = size(&node.left);
            match index.cmp(&left) {
                Ordering::Less => link = &node.left,
                Ordering::Equal => return Some((&node.key, &node.value)),
                Ordering::Greater => {
                    index -= left + 1;
                    link = &node.right;
                }
            }
        }
        None
    }

    /// 按权重下标定位：返回覆盖第 `offset` 份权重的节点，以及节点内偏移
    pub fn select_weight(&self, mut offset: usize) -> Option<(&K, &V, usize)> {
        let mut link = &self.root;
        while let Some(node) = link {
            let left = weight(&node.left);
            if offset < left {
                link = &node.left;
                continue;
            }
            offset -= left;
            let own = node.value_weight();
            if offset < own {
                return Some((&node.key, &node.value, offset));
            }
            offset -= own;
            link = &node.right;
        }
        None
    }
}

impl<K: Clone, V: Clone + Weigh> AvlTree<K, V> {
    /// 插入或替换，返回旧值
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        insert_at(&mut self.root, key, value, self.cmp.as_ref())
    }

    pub fn remove(&mut self, key: &K) -> Option<(K, V)> {
        remove_at(&mut self.root, key, self.cmp.as_ref())
    }

    /// 原地修改某个 key 的值；路径上的权重会重新计算
    pub fn update<R>(&mut self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        update_at(&mut self.root, key, self.cmp.as_ref(), f)
    }
}

fn insert_at<K: Clone, V: Clone + Weigh>(
    link: &mut Link<K, V>,
    key: K,
    value: V,
    cmp: &dyn Comparator<K>,
) -> Option<V> {
    if link.is_none() {
        *link = Some(Arc::new(Node::leaf(key, value)));
        return None;
    }
    let node = Arc::make_mut(link.as_mut()?);
    let old = match cmp.compare(&key, &node.key) {
        Ordering::Less => insert_at(&mut node.left, key, value, cmp),
        Ordering::Greater => insert_at(&mut node.right, key, value, cmp),
        Ordering::Equal => {
            let old = mem::replace(&mut node.value, value);
            node.refresh();
            return Some(old);
        }
    };
    rebalance(link);
    old
}

fn remove_at<K: Clone, V: Clone + Weigh>(
    link: &mut Link<K, V>,
    key: &K,
    cmp: &dyn Comparator<K>,
) -> Option<(K, V)> {
    let node = Arc::make_mut(link.as_mut()?);
    let removed = match cmp.compare(key, &node.key) {
        Ordering::Less => remove_at(&mut node.left, key, cmp)?,
        Ordering::Greater => remove_at(&mut node.right, key, cmp)?,
        Ordering::Equal => {
            if node.left.is_some() && node.right.is_some() {
                // 用右子树最小节点顶替
                let (k, v) = remove_min(&mut node.right)?;
                let old_key = mem::replace(&mut node.key, k);
                let old_value = mem::replace(&mut node.value, v);
                (old_key, old_value)
            } else {
                let child = node.left.take().or_else(|| node.right.take());
                let old = mem::replace(link, child)?;
                return Some(into_pair(old));
            }
        }
    };
    rebalance(link);
    Some(removed)
}

fn remove_min<K: Clone, V: Clone + Weigh>(link: &mut Link<K, V>) -> Option<(K, V)> {
    let node = Arc::make_mut(link.as_mut()?);
    if node.left.is_some() {
        let min = remove_min(&mut node.left)?;
        rebalance(link);
        Some(min)
    } else {
        let right = node.right.take();
        let old = mem::replace(link, right)?;
        Some(into_pair(old))
    }
}

fn update_at<K: Clone, V: Clone + Weigh, R>(
    link: &mut Link<K, V>,
    key: &K,
    cmp: &dyn Comparator<K>,
    f: impl FnOnce(&mut V) -> R,
) -> Option<R> {
    let node = Arc::make_mut(link.as_mut()?);
    let r = match cmp.compare(key, &node.key) {
        Ordering::Less => update_at(&mut node.left, key, cmp, f)?,
        Ordering::Greater => update_at(&mut node.right, key, cmp, f)?,
        Ordering::Equal => f(&mut node.value),
    };
    node.refresh();
    Some(r)
}

fn into_pair<K: Clone, V: Clone>(node: Arc<Node<K, V>>) -> (K, V) {
    match Arc::try_unwrap(node) {
        Ok(n) => (n.key, n.value),
        Err(shared) => (shared.key.clone(), shared.value.clone()),
    }
}

fn rebalance<K: Clone, V: Clone + Weigh>(link: &mut Link<K, V>) {
    let Some(arc) = link.as_mut() else {
        return;
    };
    let node = Arc::make_mut(arc);
    node.refresh();
    let bf = height(&node.left) as i64 - height(&node.right) as i64;
    if bf > 1 {
        if balance_of(&node.left) < 0 {
            rotate_left(&mut node.left);
        }
        rotate_right(link);
    } else if bf < -1 {
        if balance_of(&node.right) > 0 {
            rotate_right(&mut node.right);
        }
        rotate_left(link);
    }
}

fn rotate_right<K: Clone, V: Clone + Weigh>(link: &mut Link<K, V>) {
    let Some(mut root) = link.take() else {
        return;
    };
    let r = Arc::make_mut(&mut root);
    let Some(mut pivot) = r.left.take() else {
        *link = Some(root);
        return;
    };
    let p = Arc::make_mut(&mut pivot);
    r.left = p.right.take();
    r.refresh();
    p.right = Some(root);
    p.refresh();
    *link = Some(pivot);
}

fn rotate_left<K: Clone, V: Clone + Weigh>(link: &mut Link<K, V>) {
    let Some(mut root) = link.take() else {
        return;
    };
    let r = Arc::make_mut(&mut root);
    let Some(mut pivot) = r.right.take() else {
        *link = Some(root);
        return;
    };
    let p = Arc::make_mut(&mut pivot);
    r.right = p.left.take();
    r.refresh();
    p.left = Some(root);
    p.refresh();
    *link = Some(pivot);
}

/// 中序迭代器
pub struct Iter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn push_left(&mut self, mut node: Option<&'a Node<K, V>>) {
        while let Some(n) = node {
            self.stack.push(n);
            node = n.left.as_deref();
        }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(node.right.as_deref());
        Some((&node.key, &node.value))
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for AvlTree<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FnComparator, NaturalOrder};

    fn tree() -> AvlTree<u32, ()> {
        AvlTree::new(Arc::new(NaturalOrder::<u32>::new()))
    }

    fn keys(t: &AvlTree<u32, ()>) -> Vec<u32> {
        t.iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn stays_balanced_under_sequential_inserts() {
        let mut t = tree();
        for i in 0..1024 {
            t.insert(i, ());
        }
        assert_eq!(t.len(), 1024);
        // AVL 高度上界约 1.44 log2(n)
        assert!(t.height() <= 15, "height {}", t.height());
        assert_eq!(keys(&t), (0..1024).collect::<Vec<_>>());
    }

    #[test]
    fn remove_keeps_order_and_counts() {
        let mut t = tree();
        for i in [50, 20, 80, 10, 30, 70, 90, 60] {
            t.insert(i, ());
        }
        assert_eq!(t.remove(&50).map(|(k, _)| k), Some(50));
        assert_eq!(t.remove(&50), None);
        assert_eq!(t.remove(&10).map(|(k, _)| k), Some(10));
        assert_eq!(keys(&t), vec![20, 30, 60, 70, 80, 90]);
        assert_eq!(t.len(), 6);
        assert_eq!(t.weight(), 6);
    }

    #[test]
    fn rank_and_select_agree() {
        let mut t = tree();
        for i in (0..100).map(|i| i * 2) {
            t.insert(i, ());
        }
        assert_eq!(t.rank(&10, false).count, 5);
        assert_eq!(t.rank(&10, true).count, 6);
        assert_eq!(t.rank(&11, false).count, 6);
        assert_eq!(t.rank(&11, true).count, 6);
        for i in 0..100 {
            assert_eq!(t.select(i).map(|(k, _)| *k), Some(i as u32 * 2));
        }
        assert!(t.select(100).is_none());
    }

    #[test]
    fn old_versions_are_untouched() {
        let mut t = tree();
        for i in 0..10 {
            t.insert(i, ());
        }
        let frozen = t.clone();
        t.remove(&3);
        t.insert(42, ());
        assert_eq!(keys(&frozen), (0..10).collect::<Vec<_>>());
        assert!(!t.contains_key(&3));
        assert!(t.contains_key(&42));
    }

    #[test]
    fn custom_comparator_defines_order() {
        let rev = FnComparator(|a: &u32, b: &u32| b.cmp(a));
        let mut t: AvlTree<u32, ()> = AvlTree::new(Arc::new(rev));
        for i in 0..5 {
            t.insert(i, ());
        }
        assert_eq!(keys(&t), vec![4, 3, 2, 1, 0]);
        assert_eq!(t.first().map(|(k, _)| *k), Some(4));
        assert_eq!(t.last().map(|(k, _)| *k), Some(0));
    }

    #[derive(Clone)]
    struct Heavy(usize);

    impl Weigh for Heavy {
        fn weight(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn select_weight_walks_value_weights() {
        let mut t: AvlTree<u32, Heavy> = AvlTree::new(Arc::new(NaturalOrder::<u32>::new()));
        t.insert(1, Heavy(2));
        t.insert(2, Heavy(3));
        t.insert(3, Heavy(1));
        assert_eq!(t.weight(), 6);
        let at = |w| t.select_weight(w).map(|(k, _, off)| (*k, off));
        assert_eq!(at(0), Some((1, 0)));
        assert_eq!(at(1), Some((1, 1)));
        assert_eq!(at(2), Some((2, 0)));
        assert_eq!(at(4), Some((2, 2)));
        assert_eq!(at(5), Some((3, 0)));
        assert_eq!(at(6), None);

        t.update(&2, |h| h.0 = 10);
        assert_eq!(t.weight(), 13);
        assert_eq!(t.rank(&3, false).weight, 12);
    }
}
