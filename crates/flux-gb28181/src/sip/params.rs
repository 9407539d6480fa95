// SIP 参数表
// uri-parameters、header-parameters 与 uri-headers 共用的有序键值表

use crate::{Result, SipError};
use std::fmt;

/// 有序参数表
///
/// 保持插入顺序以便原样序列化；键按 ASCII 大小写不敏感查找，
/// 重复插入同名键时原位替换值。值为空的参数序列化为 flag 形式（如 `;rport`）。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderParams {
    entries: Vec<(String, String)>,
}

impl HeaderParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入参数（已存在则原位替换）
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        Some(self.entries.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 通用参数解码
    ///
    /// 以 `sep` 分隔 `key[=value]`，遇到 `end` 字符停止。
    /// 返回已消耗的字节数（不含 `end` 本身）。
    pub fn decode_into(&mut self, text: &str, sep: char, end: Option<char>) -> Result<usize> {
        let stop = end.and_then(|e| text.find(e)).unwrap_or(text.len());

        for part in text[..stop].split(sep) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = match part.find('=') {
                Some(pos) => (part[..pos].trim(), part[pos + 1..].trim()),
                None => (part, ""),
            };

            if key.is_empty() {
                return Err(SipError::parse("params", text, "empty parameter name"));
            }

            self.insert(key, value);
        }

        Ok(stop)
    }

    /// 以 `lead` 开头、`sep` 分隔写出参数；首个参数前使用 `lead`
    pub fn write_to(&self, f: &mut fmt::Formatter<'_>, lead: char, sep: char) -> fmt::Result {
        for (i, (k, v)) in self.entries.iter().enumerate() {
            let prefix = if i == 0 { lead } else { sep };
            if v.is_empty() {
                write!(f, "{}{}", prefix, k)?;
            } else {
                write!(f, "{}{}={}", prefix, k, v)?;
            }
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = HeaderParams::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}
