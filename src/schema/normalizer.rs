use unicode_normalization::UnicodeNormalization;

use crate::core::AttrValue;
use crate::error::{Result, StoreError};

/// 把属性值归约成可比较的规范形式（由匹配规则决定）。
pub trait Normalizer: Send + Sync {
    fn name(&self) -> &str;
    fn normalize(&self, value: &AttrValue) -> Result<AttrValue>;
}

/// octetStringMatch：原样返回
pub struct NoOpNormalizer;

impl Normalizer for NoOpNormalizer {
    fn name(&self) -> &str {
        "noop"
    }

    fn normalize(&self, value: &AttrValue) -> Result<AttrValue> {
        Ok(value.clone())
    }
}

/// caseExactMatch：NFKC + 首尾去空白 + 内部连续空白折叠为一个空格
pub struct DeepTrimNormalizer;

impl Normalizer for DeepTrimNormalizer {
    fn name(&self) -> &str {
        "deepTrim"
    }

    fn normalize(&self, value: &AttrValue) -> Result<AttrValue> {
        Ok(match value {
            AttrValue::Text(s) => AttrValue::Text(deep_trim(s)),
            AttrValue::Binary(b) => AttrValue::Binary(b.clone()),
        })
    }
}

/// caseIgnoreMatch：deepTrim 之后再转小写
pub struct DeepTrimToLowerNormalizer;

impl Normalizer for DeepTrimToLowerNormalizer {
    fn name(&self) -> &str {
        "deepTrimToLower"
    }

    fn normalize(&self, value: &AttrValue) -> Result<AttrValue> {
        Ok(match value {
            AttrValue::Text(s) => AttrValue::Text(deep_trim(s).to_lowercase()),
            AttrValue::Binary(b) => AttrValue::Binary(b.clone()),
        })
    }
}

/// integerMatch：可选 `-` + 数字；去掉前导零，`-0` 归为 `0`
pub struct NumericNormalizer;

impl Normalizer for NumericNormalizer {
    fn name(&self) -> &str {
        "numeric"
    }

    fn normalize(&self, value: &AttrValue) -> Result<AttrValue> {
        let Some(s) = value.as_str() else {
            return Err(invalid("integer", "binary value"));
        };
        let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let (neg, digits) = match s.strip_prefix('-') {
            Some(d) => (true, d),
            None => (false, s.as_str()),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("integer", &format!("not a number: {s:?}")));
        }
        let digits = digits.trim_start_matches('0');
        let out = match (neg, digits.is_empty()) {
            (_, true) => "0".to_string(),
            (true, false) => format!("-{digits}"),
            (false, false) => digits.to_string(),
        };
        Ok(AttrValue::Text(out))
    }
}

fn deep_trim(s: &str) -> String {
    let nfkc: String = s.nfkc().collect();
    let mut out = String::with_capacity(nfkc.len());
    for word in nfkc.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

fn invalid(rule: &str, reason: &str) -> StoreError {
    StoreError::InvalidValue {
        attribute: rule.to_string(),
        reason: reason.to_string(),
    }
}
