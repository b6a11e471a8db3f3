//! 与 schema 组件的边界。
//!
//! 存储层只消费这里的能力接口（比较器 / 归一化器），在 Table / Index 构造时注入；
//! 内部不做任何全局注册表查找。

pub mod comparator;
pub mod normalizer;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use comparator::*;
pub use normalizer::*;

use crate::core::AttrValue;

/// 匹配规则：归一化器 + 比较归一化值的比较器
#[derive(Clone)]
pub struct MatchingRule {
    pub name: String,
    pub normalizer: Arc<dyn Normalizer>,
    pub comparator: Arc<dyn Comparator<AttrValue>>,
}

impl MatchingRule {
    pub fn new(
        name: &str,
        normalizer: Arc<dyn Normalizer>,
        comparator: Arc<dyn Comparator<AttrValue>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            normalizer,
            comparator,
        }
    }

    pub fn case_ignore() -> Self {
        Self::new(
            "caseIgnoreMatch",
            Arc::new(DeepTrimToLowerNormalizer),
            Arc::new(OctetComparator),
        )
    }

    pub fn case_ignore_ordering() -> Self {
        Self::new(
            "caseIgnoreOrderingMatch",
            Arc::new(DeepTrimToLowerNormalizer),
            Arc::new(OctetComparator),
        )
    }

    pub fn case_ignore_substrings() -> Self {
        Self::new(
            "caseIgnoreSubstringsMatch",
            Arc::new(DeepTrimToLowerNormalizer),
            Arc::new(OctetComparator),
        )
    }

    pub fn case_exact() -> Self {
        Self::new(
            "caseExactMatch",
            Arc::new(DeepTrimNormalizer),
            Arc::new(OctetComparator),
        )
    }

    pub fn integer() -> Self {
        Self::new(
            "integerMatch",
            Arc::new(NumericNormalizer),
            Arc::new(IntegerComparator),
        )
    }

    pub fn integer_ordering() -> Self {
        Self::new(
            "integerOrderingMatch",
            Arc::new(NumericNormalizer),
            Arc::new(IntegerComparator),
        )
    }

    pub fn octet_string() -> Self {
        Self::new(
            "octetStringMatch",
            Arc::new(NoOpNormalizer),
            Arc::new(OctetComparator),
        )
    }
}

impl fmt::Debug for MatchingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchingRule")
            .field("name", &self.name)
            .field("normalizer", &self.normalizer.name())
            .finish()
    }
}

/// 属性类型：名字 + 三类匹配规则（均可缺省）
#[derive(Clone, Debug)]
pub struct AttributeType {
    pub name: String,
    pub equality: Option<MatchingRule>,
    pub ordering: Option<MatchingRule>,
    pub substring: Option<MatchingRule>,
}

impl AttributeType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.trim().to_ascii_lowercase(),
            equality: None,
            ordering: None,
            substring: None,
        }
    }

    pub fn with_equality(mut self, rule: MatchingRule) -> Self {
        self.equality = Some(rule);
        self
    }

    pub fn with_ordering(mut self, rule: MatchingRule) -> Self {
        self.ordering = Some(rule);
        self
    }

    pub fn with_substring(mut self, rule: MatchingRule) -> Self {
        self.substring = Some(rule);
        self
    }

    /// 字符串类属性的常见组合
    pub fn case_ignore_string(name: &str) -> Self {
        Self::new(name)
            .with_equality(MatchingRule::case_ignore())
            .with_ordering(MatchingRule::case_ignore_ordering())
            .with_substring(MatchingRule::case_ignore_substrings())
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name)
            .with_equality(MatchingRule::integer())
            .with_ordering(MatchingRule::integer_ordering())
    }

    /// 索引选择归一化规则的顺序：equality → ordering → substring
    pub fn index_rule(&self) -> Option<&MatchingRule> {
        self.equality
            .as_ref()
            .or(self.ordering.as_ref())
            .or(self.substring.as_ref())
    }
}

/// schema 组件在存储层的投影：按名字查属性类型
pub trait SchemaRegistry: Send + Sync {
    fn attribute_type(&self, name: &str) -> Option<AttributeType>;
}

/// 固定表实现；`fallback` 用于未登记的属性（为空则查不到即报错）
#[derive(Clone, Debug, Default)]
pub struct StaticSchema {
    types: HashMap<String, AttributeType>,
    fallback: Option<AttributeType>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// 常见目录属性 + caseIgnore 兜底
    pub fn with_defaults() -> Self {
        let mut s = Self::new();
        for name in [
            "cn",
            "sn",
            "ou",
            "o",
            "dc",
            "c",
            "l",
            "uid",
            "mail",
            "objectclass",
            "givenname",
            "description",
        ] {
            s.register(AttributeType::case_ignore_string(name));
        }
        for name in ["uidnumber", "gidnumber"] {
            s.register(AttributeType::integer(name));
        }
        s.register(AttributeType::new("userpassword").with_equality(MatchingRule::octet_string()));
        s.fallback = Some(AttributeType::case_ignore_string("*"));
        s
    }

    pub fn register(&mut self, at: AttributeType) {
        self.types.insert(at.name.clone(), at);
    }

    pub fn set_fallback(&mut self, at: Option<AttributeType>) {
        self.fallback = at;
    }
}

impl SchemaRegistry for StaticSchema {
    fn attribute_type(&self, name: &str) -> Option<AttributeType> {
        let key = name.trim().to_ascii_lowercase();
        if let Some(at) = self.types.get(&key) {
            return Some(at.clone());
        }
        self.fallback.as_ref().map(|fb| {
            let mut at = fb.clone();
            at.name = key;
            at
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_rule_falls_back_to_ordering_then_substring() {
        let at = AttributeType::new("x").with_substring(MatchingRule::case_ignore_substrings());
        assert_eq!(at.index_rule().unwrap().name, "caseIgnoreSubstringsMatch");

        let at = at.with_ordering(MatchingRule::integer_ordering());
        assert_eq!(at.index_rule().unwrap().name, "integerOrderingMatch");

        assert!(AttributeType::new("none").index_rule().is_none());
    }

    #[test]
    fn fallback_keeps_requested_name() {
        let s = StaticSchema::with_defaults();
        assert_eq!(s.attribute_type("CN").unwrap().name, "cn");
        assert_eq!(s.attribute_type("carLicense").unwrap().name, "carlicense");
        assert!(StaticSchema::new().attribute_type("cn").is_none());
    }
}
