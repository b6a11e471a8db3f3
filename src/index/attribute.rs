use std::path::Path;

use regex::Regex;

use crate::core::{AttrValue, Id};
use crate::cursor::Cursor;
use crate::error::{Result, StoreError};
use crate::index::Index;
use crate::schema::{AttributeType, MatchingRule, Normalizer};
use crate::storage::BackingOptions;
use crate::table::TableCursor;

/// 绑定到某个属性类型的索引：正向 key 永远是归一化后的值，探测值用同一个归一化器处理。
pub struct AttributeIndex {
    attribute: String,
    rule: MatchingRule,
    index: Index<AttrValue>,
}

impl AttributeIndex {
    /// 选规则：equality → ordering → substring；都没有则无法建索引。
    /// `dir` 为 `None` 时建纯内存索引。
    pub fn init(
        attribute_type: &AttributeType,
        dir: Option<&Path>,
        options: BackingOptions,
    ) -> Result<Self> {
        let name = attribute_type.name.to_ascii_lowercase();
        let rule = attribute_type
            .index_rule()
            .cloned()
            .ok_or_else(|| StoreError::NoNormalizerAvailable(name.clone()))?;
        let cmp = rule.comparator.clone();
        let index = match dir {
            Some(dir) => Index::open(dir, &name, cmp, true, options)?,
            None => Index::in_memory(&name, cmp, true),
        };
        tracing::info!(
            "attribute index `{}` ready (rule {}, normalizer {})",
            name,
            rule.name,
            rule.normalizer.name()
        );
        Ok(Self {
            attribute: name,
            rule,
            index,
        })
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn rule(&self) -> &MatchingRule {
        &self.rule
    }

    pub fn index(&self) -> &Index<AttrValue> {
        &self.index
    }

    /// 正向 key 使用的归一化形式；调用方可以用它预先归一化过滤条件
    pub fn normalized(&self, value: &AttrValue) -> Result<AttrValue> {
        self.rule.normalizer.normalize(value).map_err(|e| match e {
            StoreError::InvalidValue { reason, .. } => StoreError::InvalidValue {
                attribute: self.attribute.clone(),
                reason,
            },
            other => other,
        })
    }

    pub fn add(&self, value: &AttrValue, id: Id) -> Result<bool> {
        let key = self.normalized(value)?;
        self.index.add(key, id)
    }

    pub(crate) fn add_normalized(&self, key: AttrValue, id: Id) -> Result<bool> {
        self.index.add(key, id)
    }

    pub fn drop(&self, value: &AttrValue, id: Id) -> Result<bool> {
        let key = self.normalized(value)?;
        self.index.drop(&key, id)
    }

    pub(crate) fn drop_normalized(&self, key: &AttrValue, id: Id) -> Result<bool> {
        self.index.drop(key, id)
    }

    pub fn drop_id(&self, id: Id) -> Result<bool> {
        self.index.drop_id(id)
    }

    pub fn has(&self, value: &AttrValue, id: Id) -> Result<bool> {
        self.index.has(&self.normalized(value)?, id)
    }

    /// 等值查找
    pub fn lookup(&self, value: &AttrValue) -> Result<Vec<Id>> {
        self.index.forward_values(&self.normalized(value)?)
    }

    pub fn count_value(&self, value: &AttrValue) -> Result<usize> {
        self.index.count_key(&self.normalized(value)?)
    }

    pub fn forward_cursor(&self) -> Result<TableCursor<AttrValue, Id>> {
        self.index.forward_cursor()
    }

    pub fn reverse_cursor(&self) -> Result<TableCursor<Id, AttrValue>> {
        self.index.reverse_cursor()
    }

    /// 子串匹配 `initial*any1*any2*final`：逐个 key 用正则过滤，跳过同一 key 的重复 id 段。
    /// 结果按 id 升序、去重。
    pub fn substring_ids(
        &self,
        initial: Option<&str>,
        any: &[&str],
        final_: Option<&str>,
    ) -> Result<Vec<Id>> {
        let re = substring_regex(self.rule.normalizer.as_ref(), initial, any, final_)?;
        let snap = self.index.snapshot()?;
        let fwd = snap.forward;
        let mut ids = Vec::new();
        let mut cursor = TableCursor::new(fwd.clone());
        while cursor.next()? {
            let key = cursor.get_ref()?.0.clone();
            if let Some(text) = key.as_str() {
                if re.is_match(text) {
                    ids.extend(fwd.values(&key));
                }
            }
            cursor.after_key(&key)?;
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn sync(&self) -> Result<()> {
        self.index.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.index.close()
    }
}

/// 把子串断言编成锚定正则；每个片段先经过同一个归一化器
pub(crate) fn substring_regex(
    normalizer: &dyn Normalizer,
    initial: Option<&str>,
    any: &[&str],
    final_: Option<&str>,
) -> Result<Regex> {
    let norm = |s: &str| -> Result<String> {
        let v = normalizer.normalize(&AttrValue::from(s))?;
        Ok(v.as_str().map(str::to_string).unwrap_or_default())
    };
    let mut pattern = String::from("(?s)^");
    if let Some(i) = initial {
        pattern.push_str(&regex::escape(&norm(i)?));
    }
    pattern.push_str(".*");
    for a in any {
        pattern.push_str(&regex::escape(&norm(a)?));
        pattern.push_str(".*");
    }
    if let Some(f) = final_ {
        pattern.push_str(&regex::escape(&norm(f)?));
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| StoreError::InvalidValue {
        attribute: "substring".to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DeepTrimToLowerNormalizer;
    use crate::storage::tests::unique_tmp_dir;

    fn cn_index() -> AttributeIndex {
        AttributeIndex::init(
            &AttributeType::case_ignore_string("cn"),
            None,
            BackingOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn lookups_use_normalized_values() {
        let idx = cn_index();
        idx.add(&"  Alice   Smith ".into(), 1).unwrap();
        idx.add(&"ALICE smith".into(), 2).unwrap();
        assert_eq!(idx.lookup(&"alice smith".into()).unwrap(), vec![1, 2]);
        assert_eq!(idx.count_value(&"Alice Smith".into()).unwrap(), 2);
        assert_eq!(
            idx.normalized(&"  Bob ".into()).unwrap(),
            AttrValue::from("bob")
        );
        assert!(idx.drop(&"alice SMITH".into(), 1).unwrap());
        assert_eq!(idx.lookup(&"alice smith".into()).unwrap(), vec![2]);
    }

    #[test]
    fn rule_falls_back_to_ordering_then_substring() {
        let at = AttributeType::new("x").with_substring(MatchingRule::case_ignore_substrings());
        let idx = AttributeIndex::init(&at, None, BackingOptions::default()).unwrap();
        assert_eq!(idx.rule().name, "caseIgnoreSubstringsMatch");

        let at = AttributeType::new("y")
            .with_ordering(MatchingRule::integer_ordering())
            .with_substring(MatchingRule::case_ignore_substrings());
        let idx = AttributeIndex::init(&at, None, BackingOptions::default()).unwrap();
        assert_eq!(idx.rule().name, "integerOrderingMatch");
    }

    #[test]
    fn no_rule_is_a_configuration_error() {
        let at = AttributeType::new("opaque");
        assert!(matches!(
            AttributeIndex::init(&at, None, BackingOptions::default()),
            Err(StoreError::NoNormalizerAvailable(name)) if name == "opaque"
        ));
    }

    #[test]
    fn invalid_values_name_the_attribute() {
        let idx = AttributeIndex::init(
            &AttributeType::integer("uidNumber"),
            None,
            BackingOptions::default(),
        )
        .unwrap();
        match idx.add(&"12x".into(), 1) {
            Err(StoreError::InvalidValue { attribute, .. }) => assert_eq!(attribute, "uidnumber"),
            other => panic!("unexpected: {other:?}"),
        }
        idx.add(&"007".into(), 1).unwrap();
        assert_eq!(idx.lookup(&"7".into()).unwrap(), vec![1]);
    }

    #[test]
    fn substring_matches_initial_any_final() {
        let idx = cn_index();
        for (v, id) in [
            ("John Smith", 1),
            ("Johnny Appleseed", 2),
            ("Jane Smithers", 3),
            ("Bob Smith", 4),
        ] {
            idx.add(&v.into(), id).unwrap();
        }
        assert_eq!(idx.substring_ids(Some("JOHN"), &[], None).unwrap(), vec![1, 2]);
        assert_eq!(idx.substring_ids(None, &[], Some("smith")).unwrap(), vec![1, 4]);
        assert_eq!(idx.substring_ids(None, &["smith"], None).unwrap(), vec![1, 3, 4]);
        assert_eq!(
            idx.substring_ids(Some("j"), &["n"], Some("ers")).unwrap(),
            vec![3]
        );
    }

    #[test]
    fn regex_escapes_metacharacters() {
        let re = substring_regex(&DeepTrimToLowerNormalizer, Some("a.b"), &["(x)"], None).unwrap();
        assert!(re.is_match("a.b-(x)"));
        assert!(!re.is_match("axb-(x)"));
    }

    #[test]
    fn persistent_attribute_index_reopens() {
        let dir = unique_tmp_dir("attr-index");
        let at = AttributeType::case_ignore_string("mail");
        {
            let idx = AttributeIndex::init(&at, Some(&dir), BackingOptions::default()).unwrap();
            idx.add(&"A@Example.com".into(), 9).unwrap();
            idx.close().unwrap();
        }
        let idx = AttributeIndex::init(&at, Some(&dir), BackingOptions::default()).unwrap();
        assert_eq!(idx.lookup(&"a@example.com".into()).unwrap(), vec![9]);
        assert!(dir.join("mail.wal").exists());
    }
}
