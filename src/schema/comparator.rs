use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::core::AttrValue;

/// 可插拔全序比较器：Table 的键/值顺序完全由它决定，存储层不硬编码比较逻辑。
pub trait Comparator<T>: Send + Sync {
    fn compare(&self, a: &T, b: &T) -> Ordering;
}

/// `T: Ord` 的自然序
pub struct NaturalOrder<T>(PhantomData<fn(&T)>);

impl<T> NaturalOrder<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for NaturalOrder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> Comparator<T> for NaturalOrder<T> {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }
}

/// 把 `None`（缺省/空值）排在最前，其余交给内部比较器。
pub struct NullsFirst<C>(pub C);

impl<T, C: Comparator<T>> Comparator<Option<T>> for NullsFirst<C> {
    fn compare(&self, a: &Option<T>, b: &Option<T>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => self.0.compare(a, b),
        }
    }
}

/// 闭包适配
pub struct FnComparator<F>(pub F);

impl<T, F> Comparator<T> for FnComparator<F>
where
    F: Fn(&T, &T) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &T, b: &T) -> Ordering {
        (self.0)(a, b)
    }
}

/// 按字节序比较（归一化之后的字符串/二进制值都用它）
pub struct OctetComparator;

impl Comparator<AttrValue> for OctetComparator {
    fn compare(&self, a: &AttrValue, b: &AttrValue) -> Ordering {
        a.as_bytes().cmp(b.as_bytes())
    }
}

/// 十进制整数比较：输入应当已由 `NumericNormalizer` 归一化（无前导零，`-` 前缀）。
/// 非法输入退化为字节序，保证仍是全序。
pub struct IntegerComparator;

impl Comparator<AttrValue> for IntegerComparator {
    fn compare(&self, a: &AttrValue, b: &AttrValue) -> Ordering {
        match (a.as_str(), b.as_str()) {
            (Some(a), Some(b)) if is_integer(a) && is_integer(b) => compare_integers(a, b),
            _ => a.as_bytes().cmp(b.as_bytes()),
        }
    }
}

fn is_integer(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn compare_integers(a: &str, b: &str) -> Ordering {
    let (a_neg, a_digits) = split_sign(a);
    let (b_neg, b_digits) = split_sign(b);
    match (a_neg, b_neg) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare_magnitude(a_digits, b_digits),
        (true, true) => compare_magnitude(b_digits, a_digits),
    }
}

fn split_sign(s: &str) -> (bool, &str) {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, s),
    };
    let digits = digits.trim_start_matches('0');
    // "-0" 与 "0" 相等
    (neg && !digits.is_empty(), digits)
}

fn compare_magnitude(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
