// SIP URI 解析
// RFC 3261 19.1.1: sip:user:password@host:port;uri-parameters?headers
//
// 解析器是显式状态机：每个状态消费输入前缀，返回下一个状态和剩余文本。

use super::params::HeaderParams;
use crate::{Result, SipError};
use std::fmt;
use std::str::FromStr;

/// SIP URI
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uri {
    /// sips: 方案
    pub encrypted: bool,

    /// `*`（仅 Contact 允许）
    pub wildcard: bool,

    pub user: Option<String>,

    pub password: Option<String>,

    pub host: String,

    pub port: Option<u16>,

    /// `;key=value` 参数
    pub uri_params: HeaderParams,

    /// `?key=value&...` 头部参数
    pub headers: HeaderParams,
}

impl Uri {
    /// 构造 `sip:user@host:port`
    pub fn sip(user: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            user: Some(user.into()),
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn wildcard() -> Self {
        Self {
            wildcard: true,
            ..Default::default()
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// `transport` uri 参数
    pub fn transport_param(&self) -> Option<&str> {
        self.uri_params.get("transport").filter(|v| !v.is_empty())
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard {
            return write!(f, "*");
        }

        f.write_str(if self.encrypted { "sips:" } else { "sip:" })?;

        if let Some(user) = &self.user {
            f.write_str(user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            f.write_str("@")?;
        }

        f.write_str(&self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }

        self.uri_params.write_to(f, ';', ';')?;
        self.headers.write_to(f, '?', '&')
    }
}

impl FromStr for Uri {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        parse_uri(s)
    }
}

/// URI 解析状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriState {
    Scheme,
    User,
    Host,
    Port,
    UriParams,
    Headers,
}

impl UriState {
    /// 执行一个状态：消费 `s` 的前缀，返回下一个状态（None 表示结束）和剩余文本
    pub fn step<'a>(self, uri: &mut Uri, s: &'a str) -> Result<(Option<UriState>, &'a str)> {
        match self {
            UriState::Scheme => scheme_state(uri, s),
            UriState::User => user_state(uri, s),
            UriState::Host => host_state(uri, s),
            UriState::Port => port_state(uri, s),
            UriState::UriParams => uri_params_state(uri, s),
            UriState::Headers => headers_state(uri, s),
        }
    }
}

/// 解析 SIP URI
pub fn parse_uri(text: &str) -> Result<Uri> {
    let mut uri = Uri::default();
    let mut state = Some(UriState::Scheme);
    let mut rest = text.trim();

    while let Some(current) = state {
        let (next, remaining) = current.step(&mut uri, rest).map_err(|e| match e {
            SipError::Parse { reason, .. } => SipError::parse("uri", text, reason),
            other => other,
        })?;
        state = next;
        rest = remaining;
    }

    Ok(uri)
}

fn scheme_state<'a>(uri: &mut Uri, s: &'a str) -> Result<(Option<UriState>, &'a str)> {
    if s.is_empty() {
        return Err(SipError::parse("uri", s, "empty uri"));
    }

    if s == "*" {
        uri.wildcard = true;
        return Ok((None, ""));
    }

    if s.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("sips:")) {
        uri.encrypted = true;
        return Ok((Some(UriState::User), &s[5..]));
    }

    if s.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("sip:")) {
        return Ok((Some(UriState::User), &s[4..]));
    }

    if has_foreign_scheme(s) {
        return Err(SipError::parse("uri", s, "uri scheme is not sip"));
    }

    // 无方案前缀，直接从 host 开始
    Ok((Some(UriState::Host), s))
}

/// `tel:+86...`、`http://...` 之类的非 SIP 方案；`host:5060` 不算
fn has_foreign_scheme(s: &str) -> bool {
    let Some(pos) = s.find(':') else {
        return false;
    };

    let token = &s[..pos];
    let mut chars = token.chars();
    let starts_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let scheme_chars = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    let port_follows = s[pos + 1..].starts_with(|c: char| c.is_ascii_digit());

    starts_alpha && scheme_chars && !port_follows
}

fn user_state<'a>(uri: &mut Uri, s: &'a str) -> Result<(Option<UriState>, &'a str)> {
    let limit = s.find('?').unwrap_or(s.len());

    let Some(at) = s[..limit].find('@') else {
        // 没有 user 部分，原样交给 host 状态
        return Ok((Some(UriState::Host), s));
    };

    let userinfo = &s[..at];
    match userinfo.find(':') {
        Some(colon) => {
            uri.user = Some(userinfo[..colon].to_string());
            uri.password = Some(userinfo[colon + 1..].to_string());
        }
        None if !userinfo.is_empty() => {
            uri.user = Some(userinfo.to_string());
        }
        None => {}
    }

    Ok((Some(UriState::Host), &s[at + 1..]))
}

fn host_state<'a>(uri: &mut Uri, s: &'a str) -> Result<(Option<UriState>, &'a str)> {
    // IPv6 字面量 [..] 整体作为 host
    let search_from = if s.starts_with('[') {
        match s.find(']') {
            Some(end) => end + 1,
            None => return Err(SipError::parse("uri", s, "unterminated ipv6 host")),
        }
    } else {
        0
    };

    let delimiter = s[search_from..]
        .char_indices()
        .find(|(_, c)| matches!(c, ':' | ';' | '?'))
        .map(|(i, c)| (i + search_from, c));

    let (host, next) = match delimiter {
        Some((i, ':')) => (&s[..i], (Some(UriState::Port), &s[i + 1..])),
        Some((i, ';')) => (&s[..i], (Some(UriState::UriParams), &s[i + 1..])),
        Some((i, _)) => (&s[..i], (Some(UriState::Headers), &s[i + 1..])),
        None => (s, (None, "")),
    };

    if host.is_empty() {
        return Err(SipError::parse("uri", s, "missing host"));
    }

    uri.host = host.to_string();
    Ok(next)
}

fn port_state<'a>(uri: &mut Uri, s: &'a str) -> Result<(Option<UriState>, &'a str)> {
    let delimiter = s.char_indices().find(|(_, c)| matches!(c, ';' | '?'));

    let (digits, next) = match delimiter {
        Some((i, ';')) => (&s[..i], (Some(UriState::UriParams), &s[i + 1..])),
        Some((i, _)) => (&s[..i], (Some(UriState::Headers), &s[i + 1..])),
        None => (s, (None, "")),
    };

    let port = digits
        .parse::<u16>()
        .map_err(|e| SipError::parse("uri", s, format!("invalid port {:?}: {}", digits, e)))?;

    uri.port = Some(port);
    Ok(next)
}

fn uri_params_state<'a>(uri: &mut Uri, s: &'a str) -> Result<(Option<UriState>, &'a str)> {
    let consumed = uri.uri_params.decode_into(s, ';', Some('?'))?;

    if consumed < s.len() {
        return Ok((Some(UriState::Headers), &s[consumed + 1..]));
    }

    Ok((None, ""))
}

fn headers_state<'a>(uri: &mut Uri, s: &'a str) -> Result<(Option<UriState>, &'a str)> {
    uri.headers.decode_into(s, '&', None)?;
    Ok((None, ""))
}
