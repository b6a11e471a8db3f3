use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// 单个属性值：目录里绝大多数是字符串，少量是二进制（证书、jpegPhoto 等）。
///
/// `Text` 整体排在 `Binary` 之前；同类之间按字节序。
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttrValue {
    Text(String),
    Binary(Vec<u8>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            AttrValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttrValue::Text(s) => s.as_bytes(),
            AttrValue::Binary(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

impl From<Vec<u8>> for AttrValue {
    fn from(b: Vec<u8>) -> Self {
        AttrValue::Binary(b)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Text(s) => f.write_str(s),
            AttrValue::Binary(b) => {
                f.write_str("#")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// 目录条目：属性类型 → 值集合。
///
/// 属性名统一小写存储；值是集合语义，所以相等性与属性/值的插入顺序无关。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    attributes: BTreeMap<String, BTreeSet<AttrValue>>,
}

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder 风格：`Entry::new().with("cn", ["a", "b"])`
    pub fn with<I, V>(mut self, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        for v in values {
            self.add(attr, v);
        }
        self
    }

    /// 返回 true 表示是新值
    pub fn add(&mut self, attr: &str, value: impl Into<AttrValue>) -> bool {
        self.attributes
            .entry(attr_key(attr))
            .or_default()
            .insert(value.into())
    }

    pub fn remove_value(&mut self, attr: &str, value: &AttrValue) -> bool {
        let key = attr_key(attr);
        let Some(values) = self.attributes.get_mut(&key) else {
            return false;
        };
        let removed = values.remove(value);
        if values.is_empty() {
            self.attributes.remove(&key);
        }
        removed
    }

    pub fn remove_attribute(&mut self, attr: &str) -> Option<BTreeSet<AttrValue>> {
        self.attributes.remove(&attr_key(attr))
    }

    pub fn get(&self, attr: &str) -> Option<&BTreeSet<AttrValue>> {
        self.attributes.get(&attr_key(attr))
    }

    pub fn contains(&self, attr: &str, value: &AttrValue) -> bool {
        self.get(attr).is_some_and(|vs| vs.contains(value))
    }

    pub fn has_attribute(&self, attr: &str) -> bool {
        self.attributes.contains_key(&attr_key(attr))
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &BTreeSet<AttrValue>)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(|k| k.as_str())
    }

    /// 属性个数
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

fn attr_key(attr: &str) -> String {
    attr.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_insertion_order() {
        let a = Entry::new()
            .with("objectClass", ["top", "person"])
            .with("cn", ["Alice"])
            .with("sn", ["Liddell"]);
        let b = Entry::new()
            .with("SN", ["Liddell"])
            .with("cn", ["Alice"])
            .with("objectclass", ["person", "top"]);
        assert_eq!(a, b);
    }

    #[test]
    fn removing_last_value_drops_attribute() {
        let mut e = Entry::new().with("mail", ["a@example.com"]);
        assert!(e.remove_value("MAIL", &AttrValue::from("a@example.com")));
        assert!(!e.has_attribute("mail"));
        assert!(e.is_empty());
    }

    #[test]
    fn binary_display_is_hex() {
        let v = AttrValue::Binary(vec![0x0a, 0xff]);
        assert_eq!(v.to_string(), "#0aff");
    }
}
