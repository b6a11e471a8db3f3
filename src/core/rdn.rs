use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::Id;
use crate::error::{Result, StoreError};

/// attribute-value assertion：RDN 的一个组成部分，如 `ou=sales`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ava {
    pub attr_type: String,
    pub value: String,
}

impl Ava {
    pub fn new(attr_type: &str, value: &str) -> Self {
        Self {
            attr_type: attr_type.trim().to_ascii_lowercase(),
            value: value.to_string(),
        }
    }
}

/// 相对可分辨名：按属性类型排序的 AVA 序列（多值 RDN 用 `+` 连接）。
///
/// 派生的 `Ord` 就是 RDN 的序：逐个 AVA 比较（先 type 后 value），前缀更短者在前；
/// 因此空 RDN 小于任何 RDN，可作为某个 parent 区间的下界。
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    pub fn new(mut avas: Vec<Ava>) -> Self {
        avas.sort();
        avas.dedup();
        Self { avas }
    }

    pub fn single(attr_type: &str, value: &str) -> Self {
        Self::new(vec![Ava::new(attr_type, value)])
    }

    /// 空 RDN：只用作区间下界，不对应真实条目
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.avas.is_empty()
    }

    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    pub fn into_avas(self) -> Vec<Ava> {
        self.avas
    }

    /// 解析 `cn=a+sn=b`；支持 `\` 转义。
    pub fn parse(s: &str) -> Result<Self> {
        let mut avas = Vec::new();
        for part in split_unescaped(s, '+') {
            let mut kv = split_unescaped(&part, '=').into_iter();
            let (Some(t), Some(v), None) = (kv.next(), kv.next(), kv.next()) else {
                return Err(invalid_rdn(s, "expected exactly one `=` per AVA"));
            };
            let t = t.trim();
            if t.is_empty() {
                return Err(invalid_rdn(s, "empty attribute type"));
            }
            avas.push(Ava::new(t, &unescape(v.trim())));
        }
        if avas.is_empty() {
            return Err(invalid_rdn(s, "empty RDN"));
        }
        Ok(Self::new(avas))
    }

    /// 解析 DN（叶子在前，如 `cn=a,ou=sales,o=acme`），返回叶子在前的 RDN 列表。
    pub fn parse_dn(s: &str) -> Result<Vec<Self>> {
        if s.trim().is_empty() {
            return Ok(Vec::new());
        }
        split_unescaped(s, ',')
            .iter()
            .map(|r| Rdn::parse(r))
            .collect()
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}={}", ava.attr_type, escape(&ava.value))?;
        }
        Ok(())
    }
}

/// RDN 索引的复合键：(parentId, rdn)。
///
/// 字段顺序即比较顺序：先 parent 再 rdn，所以同一个 parent 的所有孩子
/// 在键空间里是一段连续区间。
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParentIdAndRdn {
    pub parent_id: Id,
    pub rdn: Rdn,
}

impl ParentIdAndRdn {
    pub fn new(parent_id: Id, rdn: Rdn) -> Self {
        Self { parent_id, rdn }
    }

    /// 部分键：`(parent, 空 RDN)`，排在该 parent 所有孩子之前
    pub fn lowest_child_of(parent_id: Id) -> Self {
        Self {
            parent_id,
            rdn: Rdn::empty(),
        }
    }
}

impl fmt::Display for ParentIdAndRdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>{}", self.parent_id, self.rdn)
    }
}

fn invalid_rdn(s: &str, reason: &str) -> StoreError {
    StoreError::InvalidValue {
        attribute: "rdn".to_string(),
        reason: format!("{reason}: {s:?}"),
    }
}

fn split_unescaped(s: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            cur.push(c);
            if let Some(n) = chars.next() {
                cur.push(n);
            }
        } else if c == sep {
            out.push(std::mem::take(&mut cur));
        } else {
            cur.push(c);
        }
    }
    out.push(cur);
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(n) = chars.next() {
                out.push(n);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | '+' | '=' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_multi_valued_sorts_avas() {
        let r = Rdn::parse("sn=Doe+CN=John").unwrap();
        assert_eq!(r.avas()[0], Ava::new("cn", "John"));
        assert_eq!(r.avas()[1], Ava::new("sn", "Doe"));
        assert_eq!(r.to_string(), "cn=John+sn=Doe");
    }

    #[test]
    fn escaped_separators_round_trip() {
        let r = Rdn::parse(r"cn=Smith\, John").unwrap();
        assert_eq!(r.avas()[0].value, "Smith, John");
        assert_eq!(Rdn::parse(&r.to_string()).unwrap(), r);
    }

    #[test]
    fn parse_dn_is_leaf_first() {
        let dn = Rdn::parse_dn("cn=a,ou=sales,o=acme").unwrap();
        assert_eq!(dn.len(), 3);
        assert_eq!(dn[2], Rdn::single("o", "acme"));
        assert!(Rdn::parse("novalue").is_err());
    }

    #[test]
    fn parent_range_is_contiguous() {
        let low = ParentIdAndRdn::lowest_child_of(2);
        let a = ParentIdAndRdn::new(1, Rdn::single("ou", "zzz"));
        let b = ParentIdAndRdn::new(2, Rdn::single("ou", "aaa"));
        let c = ParentIdAndRdn::new(3, Rdn::single("ou", "aaa"));
        assert!(a < low);
        assert!(low < b);
        assert!(b < c);
    }
}
