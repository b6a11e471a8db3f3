//! 一个目录分区的完整存储：主表 + RDN 索引 + presence 索引 + 属性索引。
//!
//! 写操作流程：从主表序列取 id → 存条目 → 同步更新每个相关索引（正反向一对）。
//! 多结构之间的写由 `write` 串行化；每个结构内部的读仍是无锁快照。
//!
//! 会先做完所有可能失败的校验（父条目、RDN 冲突、值归一化），再开始写任何结构。

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::config::StoreConfig;
use crate::core::{AttrValue, Ava, Entry, Id, ParentIdAndRdn, Rdn, ROOT_ID};
use crate::cursor::{Cursor, EmptyCursor, ListCursor};
use crate::error::{Result, StoreError};
use crate::index::attribute::substring_regex;
use crate::index::rdn::RDN_INDEX_NAME;
use crate::index::{AttributeIndex, Index, RdnIndex};
use crate::master::{MasterTable, MASTER_TABLE_NAME};
use crate::schema::{AttributeType, Comparator, MatchingRule, NaturalOrder, SchemaRegistry};
use crate::stats::{IndexStats, MasterStats, StoreStats};
use crate::table::{TableCursor, TableSnapshot};

/// presence 索引：key = 属性类型名（小写）
pub const PRESENCE_INDEX_NAME: &str = "presence";

/// 主表属性：当前一直被维护的属性索引（逗号分隔、排序）。
/// 不在其中的索引文件可能错过了写入，打开时丢弃重建。
pub const INDEXES_PROPERTY: &str = "__indexes__";

const RESERVED_NAMES: [&str; 3] = [MASTER_TABLE_NAME, RDN_INDEX_NAME, PRESENCE_INDEX_NAME];

/// 搜索范围
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

type Plan = Vec<(Arc<AttributeIndex>, BTreeSet<AttrValue>)>;

pub struct Store {
    config: StoreConfig,
    schema: Arc<dyn SchemaRegistry>,
    master: MasterTable,
    rdn: RdnIndex,
    presence: Index<String>,
    indexes: DashMap<String, Arc<AttributeIndex>>,
    write: Mutex<()>,
    closed: AtomicBool,
}

impl Store {
    pub fn open(config: StoreConfig, schema: Arc<dyn SchemaRegistry>) -> Result<Self> {
        let options = config.backing_options();
        let presence_cmp: Arc<dyn Comparator<String>> = Arc::new(NaturalOrder::<String>::new());
        let (master, rdn, presence) = match config.working_dir.as_deref() {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (
                    MasterTable::open(dir, options)?,
                    RdnIndex::open(dir, options)?,
                    Index::open(dir, PRESENCE_INDEX_NAME, presence_cmp, true, options)?,
                )
            }
            None => (
                MasterTable::in_memory(),
                RdnIndex::in_memory(),
                Index::in_memory(PRESENCE_INDEX_NAME, presence_cmp, true),
            ),
        };

        let store = Self {
            config,
            schema,
            master,
            rdn,
            presence,
            indexes: DashMap::new(),
            write: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        let maintained = store.maintained_indexes()?;
        for attr in store.config.indexed_attributes.clone() {
            let name = attr.trim().to_ascii_lowercase();
            if !maintained.contains(&name) {
                store.discard_index_files(&name)?;
            }
            store.attach_index(&name)?;
        }
        store.record_maintained_indexes()?;
        tracing::info!(
            "store opened at {}: {} entries, {} attribute index(es)",
            store.location(),
            store.master.count()?,
            store.indexes.len()
        );
        Ok(store)
    }

    fn location(&self) -> String {
        match &self.config.working_dir {
            Some(d) => d.display().to_string(),
            None => "(in memory)".to_string(),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed("store".to_string()));
        }
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn master(&self) -> &MasterTable {
        &self.master
    }

    pub fn rdn_index(&self) -> &RdnIndex {
        &self.rdn
    }

    pub fn presence_index(&self) -> &Index<String> {
        &self.presence
    }

    pub fn attribute_index(&self, attribute: &str) -> Option<Arc<AttributeIndex>> {
        self.indexes
            .get(&attribute.trim().to_ascii_lowercase())
            .map(|r| r.value().clone())
    }

    pub fn indexed_attributes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    fn attribute_indexes(&self) -> Vec<Arc<AttributeIndex>> {
        let mut all: Vec<Arc<AttributeIndex>> =
            self.indexes.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.attribute().cmp(b.attribute()));
        all
    }

    fn attribute_type(&self, attribute: &str) -> Result<AttributeType> {
        self.schema
            .attribute_type(attribute)
            .ok_or_else(|| StoreError::NoNormalizerAvailable(attribute.to_string()))
    }

    fn index_rule(&self, attribute: &str) -> Result<MatchingRule> {
        self.attribute_type(attribute)?
            .index_rule()
            .cloned()
            .ok_or_else(|| StoreError::NoNormalizerAvailable(attribute.to_string()))
    }

    fn attach_index(&self, attribute: &str) -> Result<Arc<AttributeIndex>> {
        let name = attribute.trim().to_ascii_lowercase();
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(StoreError::InvalidValue {
                attribute: name,
                reason: "name is reserved for a system structure".to_string(),
            });
        }
        if self.indexes.contains_key(&name) {
            return Err(StoreError::AlreadyExists(format!("index on `{name}`")));
        }
        let at = self.attribute_type(&name)?;
        let idx = Arc::new(AttributeIndex::init(
            &at,
            self.config.working_dir.as_deref(),
            self.config.backing_options(),
        )?);
        if idx.index().count()? == 0 && self.master.count()? > 0 {
            self.populate(&idx)?;
        }
        self.indexes.insert(name, idx.clone());
        Ok(idx)
    }

    /// 从主表补建索引：归一化在 rayon 线程池里并行，写入仍然串行
    fn populate(&self, idx: &AttributeIndex) -> Result<()> {
        let snap = self.master.snapshot()?;
        let attr = idx.attribute();
        let batches = (0..snap.count())
            .into_par_iter()
            .map(|i| -> Result<Vec<(AttrValue, Id)>> {
                let Some((id, entry)) = snap.entry_at(i) else {
                    return Ok(Vec::new());
                };
                entry
                    .get(attr)
                    .into_iter()
                    .flatten()
                    .map(|v| Ok((idx.normalized(v)?, *id)))
                    .collect()
            })
            .collect::<Result<Vec<_>>>()?;
        let mut pairs = 0usize;
        for (key, id) in batches.into_iter().flatten() {
            idx.add_normalized(key, id)?;
            pairs += 1;
        }
        tracing::info!(
            "index `{}` built from {} entries: {} pair(s)",
            attr,
            snap.count(),
            pairs
        );
        Ok(())
    }

    /// 运行时新增属性索引；已有的同名索引文件视为过期，重建
    pub fn build_index(&self, attribute: &str) -> Result<Arc<AttributeIndex>> {
        self.check_open()?;
        let _w = self.write.lock();
        let name = attribute.trim().to_ascii_lowercase();
        if self.indexes.contains_key(&name) {
            return Err(StoreError::AlreadyExists(format!("index on `{name}`")));
        }
        self.discard_index_files(&name)?;
        let idx = self.attach_index(&name)?;
        self.record_maintained_indexes()?;
        Ok(idx)
    }

    /// 上一次打开时一直在维护的属性索引
    fn maintained_indexes(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .master
            .get_property(INDEXES_PROPERTY)?
            .map(|v| {
                v.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn record_maintained_indexes(&self) -> Result<()> {
        let current = self.indexed_attributes().join(",");
        if self.master.get_property(INDEXES_PROPERTY)?.as_deref() != Some(current.as_str()) {
            self.master.set_property(INDEXES_PROPERTY, &current)?;
        }
        Ok(())
    }

    fn discard_index_files(&self, name: &str) -> Result<()> {
        match self.config.working_dir.as_deref() {
            Some(dir) if !RESERVED_NAMES.contains(&name) => remove_structure(dir, name),
            _ => Ok(()),
        }
    }

    /// RDN 的每个 AVA 用属性的索引规则归一化
    pub fn normalize_rdn(&self, rdn: &Rdn) -> Result<Rdn> {
        if rdn.is_empty() {
            return Err(StoreError::InvalidValue {
                attribute: "rdn".to_string(),
                reason: "empty RDN".to_string(),
            });
        }
        let avas = rdn
            .avas()
            .iter()
            .map(|ava| {
                let rule = self.index_rule(&ava.attr_type)?;
                let raw = AttrValue::from(ava.value.as_str());
                let norm = rule.normalizer.normalize(&raw)?;
                Ok(Ava::new(&ava.attr_type, norm.as_str().unwrap_or(ava.value.as_str())))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Rdn::new(avas))
    }

    fn normalized_values(idx: &AttributeIndex, entry: &Entry) -> Result<BTreeSet<AttrValue>> {
        entry
            .get(idx.attribute())
            .into_iter()
            .flatten()
            .map(|v| idx.normalized(v))
            .collect()
    }

    /// 每个属性索引要写入的归一化值；任何值不合法时整个操作在写入前失败
    fn plan(&self, entry: &Entry) -> Result<Plan> {
        self.attribute_indexes()
            .into_iter()
            .map(|idx| {
                let values = Self::normalized_values(&idx, entry)?;
                Ok((idx, values))
            })
            .collect()
    }

    /// 在 `parent_id` 下新增条目，返回新 id
    pub fn add(&self, parent_id: Id, rdn: &Rdn, entry: Entry) -> Result<Id> {
        self.check_open()?;
        let _w = self.write.lock();
        if parent_id != ROOT_ID && !self.master.contains(parent_id)? {
            return Err(StoreError::not_found(format!("parent entry {parent_id}")));
        }
        let rdn = self.normalize_rdn(rdn)?;
        if let Some(existing) = self.rdn.lookup(parent_id, &rdn)? {
            return Err(StoreError::AlreadyExists(format!(
                "{rdn} under entry {parent_id} (entry {existing})"
            )));
        }
        let plan = self.plan(&entry)?;
        let names: Vec<String> = entry.attribute_names().map(str::to_string).collect();

        let id = self.master.next_id()?;
        if self.master.contains(id)? || self.rdn.location(id)?.is_some() {
            return Err(StoreError::AlreadyExists(format!(
                "sequence issued id {id}, which is already in use"
            )));
        }
        self.master.put(entry, id)?;
        self.rdn.add(ParentIdAndRdn::new(parent_id, rdn), id)?;
        for name in names {
            self.presence.add(name, id)?;
        }
        for (idx, values) in plan {
            for v in values {
                idx.add_normalized(v, id)?;
            }
        }
        tracing::debug!("added entry {} under {}", id, parent_id);
        Ok(id)
    }

    pub fn lookup(&self, id: Id) -> Result<Entry> {
        self.check_open()?;
        self.master.get(id)
    }

    /// 自顶向下解析 DN（参数叶子在前，与 `Rdn::parse_dn` 一致）；空 DN 解析为根
    pub fn resolve(&self, dn: &[Rdn]) -> Result<Id> {
        self.check_open()?;
        let mut current = ROOT_ID;
        for rdn in dn.iter().rev() {
            let norm = self.normalize_rdn(rdn)?;
            current = self
                .rdn
                .lookup(current, &norm)?
                .ok_or_else(|| StoreError::not_found(format!("{rdn} under entry {current}")))?;
        }
        Ok(current)
    }

    pub fn resolve_dn(&self, dn: &str) -> Result<Id> {
        self.resolve(&Rdn::parse_dn(dn)?)
    }

    /// 自底向上拼出 RDN 路径（叶子在前，归一化形式）
    pub fn dn(&self, id: Id) -> Result<Vec<Rdn>> {
        self.check_open()?;
        let limit = self.rdn.count()? + 1;
        let mut path = Vec::new();
        let mut current = id;
        while current != ROOT_ID {
            let loc = self
                .rdn
                .location(current)?
                .ok_or_else(|| StoreError::not_found(format!("location of entry {current}")))?;
            path.push(loc.rdn);
            current = loc.parent_id;
            if path.len() > limit {
                return Err(StoreError::InvalidValue {
                    attribute: RDN_INDEX_NAME.to_string(),
                    reason: format!("parent chain of entry {id} does not reach the root"),
                });
            }
        }
        Ok(path)
    }

    pub fn dn_string(&self, id: Id) -> Result<String> {
        Ok(self
            .dn(id)?
            .iter()
            .map(Rdn::to_string)
            .collect::<Vec<_>>()
            .join(","))
    }

    /// 整体替换条目；索引按归一化值的差集更新
    pub fn modify(&self, id: Id, entry: Entry) -> Result<()> {
        self.check_open()?;
        let _w = self.write.lock();
        let old = self.master.get(id)?;
        let mut diffs = Vec::new();
        for idx in self.attribute_indexes() {
            let before = Self::normalized_values(&idx, &old)?;
            let after = Self::normalized_values(&idx, &entry)?;
            let removed: Vec<AttrValue> = before.difference(&after).cloned().collect();
            let added: Vec<AttrValue> = after.difference(&before).cloned().collect();
            diffs.push((idx, removed, added));
        }
        let old_names: BTreeSet<String> = old.attribute_names().map(str::to_string).collect();
        let new_names: BTreeSet<String> = entry.attribute_names().map(str::to_string).collect();

        self.master.put(entry, id)?;
        for name in old_names.difference(&new_names) {
            self.presence.drop(name, id)?;
        }
        for name in new_names.difference(&old_names) {
            self.presence.add(name.clone(), id)?;
        }
        for (idx, removed, added) in diffs {
            for v in &removed {
                idx.drop_normalized(v, id)?;
            }
            for v in added {
                idx.add_normalized(v, id)?;
            }
        }
        tracing::debug!("modified entry {}", id);
        Ok(())
    }

    /// 叶子才能删除；先清索引再删主表，返回被删条目
    pub fn delete(&self, id: Id) -> Result<Entry> {
        self.check_open()?;
        let _w = self.write.lock();
        if self.rdn.has_children(id)? {
            return Err(StoreError::HasChildren(id));
        }
        if !self.master.contains(id)? {
            return Err(StoreError::not_found(format!("entry {id}")));
        }
        for idx in self.attribute_indexes() {
            idx.drop_id(id)?;
        }
        self.presence.drop_id(id)?;
        self.rdn.drop_id(id)?;
        let removed = self.master.delete(id)?;
        tracing::debug!("deleted entry {}", id);
        Ok(removed)
    }

    /// 移动（可同时改名）：RDN 索引上先 drop 再 add
    pub fn move_entry(&self, id: Id, new_parent: Id, new_rdn: &Rdn) -> Result<()> {
        self.check_open()?;
        let _w = self.write.lock();
        self.relocate(id, Some(new_parent), new_rdn)
    }

    /// 只改 RDN，不换 parent（parent 在写锁内读取）
    pub fn rename(&self, id: Id, new_rdn: &Rdn) -> Result<()> {
        self.check_open()?;
        let _w = self.write.lock();
        self.relocate(id, None, new_rdn)
    }

    /// 调用方持有 `write`；`new_parent` 为 None 表示留在原 parent 下
    fn relocate(&self, id: Id, new_parent: Option<Id>, new_rdn: &Rdn) -> Result<()> {
        let old = self
            .rdn
            .location(id)?
            .ok_or_else(|| StoreError::not_found(format!("location of entry {id}")))?;
        let new_parent = new_parent.unwrap_or(old.parent_id);
        if new_parent != ROOT_ID && !self.master.contains(new_parent)? {
            return Err(StoreError::not_found(format!("parent entry {new_parent}")));
        }
        if self.is_in_subtree(new_parent, id)? {
            return Err(StoreError::InvalidValue {
                attribute: "parent".to_string(),
                reason: format!("entry {id} cannot be moved under its own subtree"),
            });
        }
        let key = ParentIdAndRdn::new(new_parent, self.normalize_rdn(new_rdn)?);
        if key == old {
            return Ok(());
        }
        if let Some(existing) = self.rdn.lookup(new_parent, &key.rdn)? {
            return Err(StoreError::AlreadyExists(format!(
                "{} under entry {new_parent} (entry {existing})",
                key.rdn
            )));
        }
        self.rdn.drop(&old, id)?;
        self.rdn.add(key, id)?;
        tracing::debug!("moved entry {} from {} to {}", id, old.parent_id, new_parent);
        Ok(())
    }

    /// `candidate` 是否等于 `ancestor` 或在其子树内
    fn is_in_subtree(&self, candidate: Id, ancestor: Id) -> Result<bool> {
        let limit = self.rdn.count()? + 1;
        let mut current = candidate;
        for _ in 0..=limit {
            if current == ancestor {
                return Ok(true);
            }
            if current == ROOT_ID {
                return Ok(false);
            }
            current = match self.rdn.location(current)? {
                Some(loc) => loc.parent_id,
                None => return Ok(false),
            };
        }
        Ok(false)
    }

    /// 直接孩子的游标（按 RDN 排序）
    pub fn children(&self, parent_id: Id) -> Result<TableCursor<ParentIdAndRdn, Id>> {
        self.check_open()?;
        self.rdn.children(parent_id)
    }

    pub fn one_level(&self, parent_id: Id) -> Result<Vec<Id>> {
        self.children(parent_id)?
            .elements()
            .map(|r| r.map(|t| t.value))
            .collect()
    }

    /// 先序遍历：`base` 自身（根除外）+ 全部后代，同层按 RDN 排序
    pub fn subtree(&self, base: Id) -> Result<Vec<Id>> {
        self.check_open()?;
        if base != ROOT_ID && !self.master.contains(base)? {
            return Err(StoreError::not_found(format!("entry {base}")));
        }
        let mut out = Vec::new();
        let mut stack = vec![base];
        while let Some(id) = stack.pop() {
            if id != ROOT_ID {
                out.push(id);
            }
            let kids = self.one_level(id)?;
            stack.extend(kids.into_iter().rev());
        }
        Ok(out)
    }

    /// 按范围取候选 id 的游标。base 范围只含 `base`（根没有条目，结果为空）；
    /// one-level / subtree 的结果按 id 排序。
    pub fn scope(&self, base: Id, scope: SearchScope) -> Result<Box<dyn Cursor<Element = Id>>> {
        self.check_open()?;
        let order: Arc<dyn Comparator<Id>> = Arc::new(NaturalOrder::<Id>::new());
        let cursor: Box<dyn Cursor<Element = Id>> = match scope {
            SearchScope::Base if base == ROOT_ID => Box::new(EmptyCursor::<Id>::new()),
            SearchScope::Base => {
                if !self.master.contains(base)? {
                    return Err(StoreError::not_found(format!("entry {base}")));
                }
                Box::new(ListCursor::singleton(base, order))
            }
            SearchScope::OneLevel => {
                if base != ROOT_ID && !self.master.contains(base)? {
                    return Err(StoreError::not_found(format!("entry {base}")));
                }
                Box::new(ListCursor::new(self.one_level(base)?, order))
            }
            SearchScope::Subtree => Box::new(ListCursor::new(self.subtree(base)?, order)),
        };
        Ok(cursor)
    }

    /// 等值过滤；没有索引时并行扫描主表
    pub fn equality(&self, attribute: &str, value: &AttrValue) -> Result<Vec<Id>> {
        self.check_open()?;
        let name = attribute.trim().to_ascii_lowercase();
        if let Some(idx) = self.attribute_index(&name) {
            return idx.lookup(value);
        }
        let rule = self.index_rule(&name)?;
        let wanted = rule.normalizer.normalize(value)?;
        self.scan(|entry| {
            entry.get(&name).is_some_and(|vals| {
                vals.iter().any(|v| {
                    rule.normalizer
                        .normalize(v)
                        .is_ok_and(|n| rule.comparator.compare(&n, &wanted).is_eq())
                })
            })
        })
    }

    pub fn presence(&self, attribute: &str) -> Result<Vec<Id>> {
        self.check_open()?;
        self.presence
            .forward_values(&attribute.trim().to_ascii_lowercase())
    }

    /// 子串过滤 `initial*any*final`；没有索引时并行扫描主表
    pub fn substring(
        &self,
        attribute: &str,
        initial: Option<&str>,
        any: &[&str],
        final_: Option<&str>,
    ) -> Result<Vec<Id>> {
        self.check_open()?;
        let name = attribute.trim().to_ascii_lowercase();
        if let Some(idx) = self.attribute_index(&name) {
            return idx.substring_ids(initial, any, final_);
        }
        let at = self.attribute_type(&name)?;
        let rule = at
            .substring
            .as_ref()
            .or(at.index_rule())
            .cloned()
            .ok_or_else(|| StoreError::NoNormalizerAvailable(name.clone()))?;
        let re = substring_regex(rule.normalizer.as_ref(), initial, any, final_)?;
        self.scan(|entry| {
            entry.get(&name).is_some_and(|vals| {
                vals.iter().any(|v| {
                    rule.normalizer
                        .normalize(v)
                        .ok()
                        .and_then(|n| n.as_str().map(|s| re.is_match(s)))
                        .unwrap_or(false)
                })
            })
        })
    }

    fn scan(&self, pred: impl Fn(&Entry) -> bool + Sync) -> Result<Vec<Id>> {
        let snap: Arc<TableSnapshot<Id, Entry>> = self.master.snapshot()?;
        Ok((0..snap.count())
            .into_par_iter()
            .filter_map(|i| {
                snap.entry_at(i)
                    .filter(|&(_, entry)| pred(entry))
                    .map(|(id, _)| *id)
            })
            .collect())
    }

    /// 结构一致性检查，返回发现的问题（空 = 一致）
    pub fn verify(&self) -> Result<Vec<String>> {
        self.check_open()?;
        let _w = self.write.lock();
        let mut problems = self.rdn.verify()?;
        problems.extend(self.presence.verify()?);
        for idx in self.attribute_indexes() {
            problems.extend(idx.index().verify()?);
        }

        let master = self.master.snapshot()?;
        for i in 0..master.count() {
            let Some((id, entry)) = master.entry_at(i) else {
                continue;
            };
            match self.rdn.location(*id)? {
                None => problems.push(format!("entry {id} has no location in the rdn index")),
                Some(loc) if loc.parent_id != ROOT_ID && !master.has(&loc.parent_id) => {
                    problems.push(format!(
                        "entry {id} hangs under missing parent {}",
                        loc.parent_id
                    ));
                }
                Some(_) => {}
            }
            for name in entry.attribute_names() {
                if !self.presence.has(&name.to_string(), *id)? {
                    problems.push(format!("entry {id}: attribute `{name}` missing from presence"));
                }
            }
        }

        // 属性索引内容必须正好是主表值的归一化结果
        for idx in self.attribute_indexes() {
            let snap = idx.index().snapshot()?;
            for i in 0..master.count() {
                let Some((id, entry)) = master.entry_at(i) else {
                    continue;
                };
                let expected = match Self::normalized_values(&idx, entry) {
                    Ok(values) => values,
                    Err(e) => {
                        problems.push(format!(
                            "entry {id}: `{}` value rejected: {e}",
                            idx.attribute()
                        ));
                        continue;
                    }
                };
                let indexed: BTreeSet<AttrValue> = snap.reverse.values(id).into_iter().collect();
                for missing in expected.difference(&indexed) {
                    problems.push(format!(
                        "entry {id}: `{}` value `{missing}` missing from its index",
                        idx.attribute()
                    ));
                }
                for extra in indexed.difference(&expected) {
                    problems.push(format!(
                        "entry {id}: `{}` index holds `{extra}` which the entry lacks",
                        idx.attribute()
                    ));
                }
            }
            for i in 0..snap.reverse.count() {
                if let Some((id, key)) = snap.reverse.entry_at(i) {
                    if !master.has(id) {
                        problems.push(format!(
                            "`{}` index maps `{key}` to unknown entry {id}",
                            idx.attribute()
                        ));
                    }
                }
            }
        }

        let rdn = self.rdn.index().snapshot()?;
        for i in 0..rdn.reverse.count() {
            if let Some((id, key)) = rdn.reverse.entry_at(i) {
                if !master.has(id) {
                    problems.push(format!("rdn index places unknown entry {id} at {key}"));
                }
            }
        }

        if problems.is_empty() {
            tracing::info!("verify: {} entries consistent", master.count());
        } else {
            tracing::warn!("verify: {} problem(s) found", problems.len());
        }
        Ok(problems)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.check_open()?;
        let mut indexes = Vec::new();
        for idx in self.attribute_indexes() {
            indexes.push(IndexStats {
                attribute: idx.attribute().to_string(),
                rule: idx.rule().name.clone(),
                distinct_values: idx.index().key_count()?,
                pairs: idx.index().count()?,
                journal_bytes: idx.index().journal_bytes(),
            });
        }
        Ok(StoreStats {
            working_dir: self
                .config
                .working_dir
                .as_ref()
                .map(|d| d.display().to_string()),
            master: MasterStats {
                entry_count: self.master.count()?,
                current_id: self.master.current_id()?,
                property_count: self.master.properties()?.len(),
                journal_bytes: self.master.journal_bytes(),
            },
            rdn_pairs: self.rdn.count()?,
            presence_pairs: self.presence.count()?,
            indexes,
        })
    }

    /// 所有结构写 checkpoint
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        let _w = self.write.lock();
        self.master.sync()?;
        self.rdn.sync()?;
        self.presence.sync()?;
        for idx in self.attribute_indexes() {
            idx.sync()?;
        }
        tracing::info!("store synced");
        Ok(())
    }

    /// 幂等；每个结构都会被关闭，即使前面的关闭失败，返回第一个错误
    pub fn close(&self) -> Result<()> {
        let _w = self.write.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut results = vec![self.master.close(), self.rdn.close(), self.presence.close()];
        for idx in self.attribute_indexes() {
            results.push(idx.close());
        }
        tracing::info!("store at {} closed", self.location());
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn remove_structure(dir: &Path, name: &str) -> Result<()> {
    for ext in ["db", "wal"] {
        let path = dir.join(format!("{name}.{ext}"));
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("removed stale {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StaticSchema;
    use crate::storage::tests::unique_tmp_dir;

    fn schema() -> Arc<dyn SchemaRegistry> {
        Arc::new(StaticSchema::with_defaults())
    }

    fn rdn(s: &str) -> Rdn {
        Rdn::parse(s).unwrap()
    }

    fn person(cn: &str, mail: &str) -> Entry {
        Entry::new()
            .with("objectClass", ["top", "person"])
            .with("cn", [cn])
            .with("mail", [mail])
    }

    /// o=acme → ou=sales → cn=alice / cn=bob；ou=eng 空
    fn sample(store: &Store) -> (Id, Id, Id, Id, Id) {
        let org = store
            .add(ROOT_ID, &rdn("o=acme"), Entry::new().with("o", ["acme"]))
            .unwrap();
        let sales = store
            .add(org, &rdn("ou=Sales"), Entry::new().with("ou", ["Sales"]))
            .unwrap();
        let eng = store
            .add(org, &rdn("ou=eng"), Entry::new().with("ou", ["eng"]))
            .unwrap();
        let alice = store
            .add(sales, &rdn("cn=Alice"), person("Alice", "alice@acme.com"))
            .unwrap();
        let bob = store
            .add(sales, &rdn("cn=Bob"), person("Bob", "bob@acme.com"))
            .unwrap();
        (org, sales, eng, alice, bob)
    }

    fn memory_store() -> Store {
        Store::open(StoreConfig::in_memory().with_index("cn"), schema()).unwrap()
    }

    #[test]
    fn add_resolve_and_dn() {
        let store = memory_store();
        let (org, sales, _, alice, _) = sample(&store);
        assert_eq!(store.resolve_dn("cn=ALICE, ou=sales,o=acme").unwrap(), alice);
        assert_eq!(store.resolve_dn("o=acme").unwrap(), org);
        assert_eq!(store.resolve_dn("").unwrap(), ROOT_ID);
        assert!(store.resolve_dn("cn=nobody,o=acme").unwrap_err().is_not_found());
        assert_eq!(store.dn_string(alice).unwrap(), "cn=alice,ou=sales,o=acme");
        assert_eq!(store.lookup(sales).unwrap(), Entry::new().with("ou", ["Sales"]));
    }

    #[test]
    fn sibling_names_are_unique_after_normalization() {
        let store = memory_store();
        let (org, ..) = sample(&store);
        assert!(matches!(
            store.add(org, &rdn("OU=  sales "), Entry::new()),
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.add(999, &rdn("cn=x"), Entry::new()),
            Err(StoreError::NotFound(_))
        ));
        // 失败的 add 不消耗 id
        assert_eq!(store.master().current_id().unwrap(), 5);
    }

    #[test]
    fn scopes_enumerate_the_tree() {
        let store = memory_store();
        let (org, sales, eng, alice, bob) = sample(&store);
        assert_eq!(store.one_level(sales).unwrap(), vec![alice, bob]);
        assert_eq!(store.one_level(ROOT_ID).unwrap(), vec![org]);
        assert_eq!(store.subtree(org).unwrap(), vec![org, eng, sales, alice, bob]);
        assert_eq!(store.subtree(eng).unwrap(), vec![eng]);
        assert_eq!(store.subtree(ROOT_ID).unwrap().len(), 5);
    }

    #[test]
    fn filters_use_indexes_or_scan() {
        let store = memory_store();
        let (_, _, _, alice, bob) = sample(&store);
        assert_eq!(store.equality("CN", &"alice".into()).unwrap(), vec![alice]);
        // mail 没有索引：走扫描
        assert_eq!(
            store.equality("mail", &"BOB@acme.com".into()).unwrap(),
            vec![bob]
        );
        assert_eq!(store.presence("mail").unwrap(), vec![alice, bob]);
        assert_eq!(
            store.substring("cn", Some("al"), &[], None).unwrap(),
            vec![alice]
        );
        assert_eq!(
            store.substring("mail", None, &[], Some("@ACME.com")).unwrap(),
            vec![alice, bob]
        );
    }

    #[test]
    fn modify_updates_indexes_by_diff() {
        let store = memory_store();
        let (_, _, _, alice, _) = sample(&store);
        let changed = Entry::new()
            .with("objectClass", ["top", "person"])
            .with("cn", ["Alice", "Ally"]);
        store.modify(alice, changed).unwrap();
        assert_eq!(store.equality("cn", &"ally".into()).unwrap(), vec![alice]);
        assert_eq!(store.equality("cn", &"alice".into()).unwrap(), vec![alice]);
        assert!(!store.presence("mail").unwrap().contains(&alice));
        assert!(store.verify().unwrap().is_empty());
    }

    #[test]
    fn delete_requires_leaf() {
        let store = memory_store();
        let (_, sales, _, alice, bob) = sample(&store);
        assert!(matches!(store.delete(sales), Err(StoreError::HasChildren(id)) if id == sales));
        let removed = store.delete(alice).unwrap();
        assert_eq!(removed.get("mail").map(|v| v.len()), Some(1));
        store.delete(bob).unwrap();
        store.delete(sales).unwrap();
        assert!(store.equality("cn", &"alice".into()).unwrap().is_empty());
        assert!(store.presence("mail").unwrap().is_empty());
        assert!(matches!(store.delete(alice), Err(StoreError::NotFound(_))));
        assert!(store.verify().unwrap().is_empty());
    }

    #[test]
    fn move_and_rename() {
        let store = memory_store();
        let (org, sales, eng, alice, _) = sample(&store);
        store.move_entry(alice, eng, &rdn("cn=alice")).unwrap();
        assert_eq!(store.dn_string(alice).unwrap(), "cn=alice,ou=eng,o=acme");
        store.rename(alice, &rdn("cn=alicia")).unwrap();
        assert_eq!(store.resolve_dn("cn=alicia,ou=eng,o=acme").unwrap(), alice);

        assert!(matches!(
            store.move_entry(org, sales, &rdn("o=acme")),
            Err(StoreError::InvalidValue { .. })
        ));
        assert!(matches!(
            store.move_entry(sales, org, &rdn("ou=eng")),
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(store.verify().unwrap().is_empty());
    }

    #[test]
    fn build_index_covers_existing_entries() {
        let store = memory_store();
        let (_, _, _, alice, bob) = sample(&store);
        let idx = store.build_index("mail").unwrap();
        assert_eq!(idx.lookup(&"ALICE@acme.com".into()).unwrap(), vec![alice]);
        assert_eq!(store.indexed_attributes(), vec!["cn", "mail"]);
        assert!(matches!(
            store.build_index("mail"),
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.build_index("rdn"),
            Err(StoreError::InvalidValue { .. })
        ));
        let carol = store
            .add(alice, &rdn("cn=carol"), person("Carol", "carol@acme.com"))
            .unwrap();
        assert_eq!(
            store.substring("mail", None, &["acme"], None).unwrap(),
            vec![alice, bob, carol]
        );
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = unique_tmp_dir("store-reopen");
        let config = StoreConfig::at(&dir).with_index("cn");
        let alice = {
            let store = Store::open(config.clone(), schema()).unwrap();
            let (_, _, _, alice, _) = sample(&store);
            store.sync().unwrap();
            store
                .modify(alice, person("Alice", "alice@example.org"))
                .unwrap();
            store.close().unwrap();
            store.close().unwrap();
            alice
        };
        let store = Store::open(config.with_index("mail"), schema()).unwrap();
        assert_eq!(store.resolve_dn("cn=alice,ou=sales,o=acme").unwrap(), alice);
        assert_eq!(
            store.equality("mail", &"alice@example.org".into()).unwrap(),
            vec![alice]
        );
        assert_eq!(store.master().next_id().unwrap(), 6);
        assert!(store.verify().unwrap().is_empty());
        let stats = store.stats().unwrap();
        assert_eq!(stats.master.entry_count, 5);
        assert_eq!(stats.indexes.len(), 2);
    }

    #[test]
    fn closed_store_rejects_everything() {
        let store = memory_store();
        sample(&store);
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.lookup(1), Err(StoreError::Closed(_))));
        assert!(matches!(
            store.add(ROOT_ID, &rdn("o=x"), Entry::new()),
            Err(StoreError::Closed(_))
        ));
    }

    #[test]
    fn unknown_attribute_without_fallback_fails() {
        let store = Store::open(StoreConfig::in_memory(), Arc::new(StaticSchema::new())).unwrap();
        assert!(matches!(
            store.add(ROOT_ID, &rdn("o=x"), Entry::new()),
            Err(StoreError::NoNormalizerAvailable(_))
        ));
        assert!(matches!(
            Store::open(StoreConfig::in_memory().with_index("cn"), Arc::new(StaticSchema::new())),
            Err(StoreError::NoNormalizerAvailable(_))
        ));
    }

    #[test]
    fn add_refuses_an_id_already_in_use() {
        let store = memory_store();
        sample(&store);
        let squatter = Entry::new().with("o", ["squatter"]);
        store.master().put(squatter.clone(), 6).unwrap();
        assert!(matches!(
            store.add(ROOT_ID, &rdn("o=late"), Entry::new().with("o", ["late"])),
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(store.master().get(6).unwrap(), squatter);
        assert!(store.resolve_dn("o=late").unwrap_err().is_not_found());

        // 下一个 id 空闲，正常写入
        let late = store
            .add(ROOT_ID, &rdn("o=late"), Entry::new().with("o", ["late"]))
            .unwrap();
        assert_eq!(late, 7);
    }

    #[test]
    fn index_missing_a_session_is_rebuilt() {
        let dir = unique_tmp_dir("store-stale-index");
        let entry = |mail: &str| Entry::new().with("o", ["x"]).with("mail", [mail]);
        let id = {
            let store = Store::open(StoreConfig::at(&dir).with_index("mail"), schema()).unwrap();
            let id = store.add(ROOT_ID, &rdn("o=x"), entry("old@x")).unwrap();
            store.close().unwrap();
            id
        };
        {
            let store = Store::open(StoreConfig::at(&dir), schema()).unwrap();
            assert!(store.indexed_attributes().is_empty());
            store.modify(id, entry("new@x")).unwrap();
            store.close().unwrap();
        }
        let store = Store::open(StoreConfig::at(&dir).with_index("mail"), schema()).unwrap();
        assert_eq!(store.equality("mail", &"new@x".into()).unwrap(), vec![id]);
        assert!(store.equality("mail", &"old@x".into()).unwrap().is_empty());
        assert!(store.verify().unwrap().is_empty());
    }

    #[test]
    fn verify_compares_indexes_with_entries() {
        let store = memory_store();
        let (_, _, _, alice, bob) = sample(&store);
        let cn = store.attribute_index("cn").unwrap();
        cn.add(&"ghost".into(), alice).unwrap();
        (*cn).drop(&"Bob".into(), bob).unwrap();
        cn.add(&"nobody".into(), 999).unwrap();

        let problems = store.verify().unwrap();
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(problems
            .iter()
            .any(|p| p.contains(&format!("entry {alice}")) && p.contains("ghost")));
        assert!(problems
            .iter()
            .any(|p| p.contains(&format!("entry {bob}")) && p.contains("missing")));
        assert!(problems.iter().any(|p| p.contains("unknown entry 999")));
    }

    #[test]
    fn rename_never_undoes_a_concurrent_move() {
        let store = memory_store();
        let (_, _, eng, alice, _) = sample(&store);
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..200 {
                    let name = if i % 2 == 0 { "cn=alicia" } else { "cn=alice" };
                    store.rename(alice, &rdn(name)).unwrap();
                }
            });
            s.spawn(|| {
                std::thread::yield_now();
                store.move_entry(alice, eng, &rdn("cn=alice")).unwrap();
            });
        });
        assert!(store.dn_string(alice).unwrap().ends_with(",ou=eng,o=acme"));
        assert!(store.one_level(eng).unwrap().contains(&alice));
        assert!(store.verify().unwrap().is_empty());
    }

    #[test]
    fn scope_cursors() {
        let store = memory_store();
        let (org, sales, eng, alice, bob) = sample(&store);
        let ids = |base, scope| {
            store
                .scope(base, scope)
                .unwrap()
                .elements()
                .collect::<Result<Vec<Id>>>()
                .unwrap()
        };
        assert_eq!(ids(alice, SearchScope::Base), vec![alice]);
        assert!(ids(ROOT_ID, SearchScope::Base).is_empty());
        assert_eq!(ids(sales, SearchScope::OneLevel), vec![alice, bob]);
        assert_eq!(ids(org, SearchScope::Subtree), vec![org, sales, eng, alice, bob]);
        assert_eq!(ids(ROOT_ID, SearchScope::OneLevel), vec![org]);

        let mut cursor = store.scope(sales, SearchScope::Subtree).unwrap();
        cursor.after(&alice).unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.get().unwrap(), bob);
        assert!(!cursor.next().unwrap());

        assert!(matches!(
            store.scope(999, SearchScope::Base),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.scope(999, SearchScope::OneLevel),
            Err(StoreError::NotFound(_))
        ));
    }
}
