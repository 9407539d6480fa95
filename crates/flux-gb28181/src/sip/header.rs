// SIP 方法与头部模型

use super::params::HeaderParams;
use super::uri::Uri;
use std::fmt;

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Options,
    Subscribe,
    Notify,
    Info,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Message => "MESSAGE",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Info => "INFO",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REGISTER" => Some(Method::Register),
            "INVITE" => Some(Method::Invite),
            "ACK" => Some(Method::Ack),
            "BYE" => Some(Method::Bye),
            "CANCEL" => Some(Method::Cancel),
            "MESSAGE" => Some(Method::Message),
            "OPTIONS" => Some(Method::Options),
            "SUBSCRIBE" => Some(Method::Subscribe),
            "NOTIFY" => Some(Method::Notify),
            "INFO" => Some(Method::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// name-addr：`"Display" <uri>;params`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: HeaderParams,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            uri,
            params: HeaderParams::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag").filter(|t| !t.is_empty())
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.uri.wildcard {
            f.write_str("*")?;
        } else {
            if let Some(name) = &self.display_name {
                write!(f, "\"{}\" ", name)?;
            }
            write!(f, "<{}>", self.uri)?;
        }
        self.params.write_to(f, ';', ';')
    }
}

/// Via 头部（单跳）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub protocol_name: String,
    pub protocol_version: String,
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: HeaderParams,
}

impl ViaHeader {
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            protocol_name: "SIP".to_string(),
            protocol_version: "2.0".to_string(),
            transport: transport.into(),
            host: host.into(),
            port,
            params: HeaderParams::new(),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch")
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.params.insert("branch", branch);
    }

    pub fn received(&self) -> Option<&str> {
        self.params.get("received").filter(|v| !v.is_empty())
    }

    /// `rport` 带值时返回端口；flag 形式返回 None
    pub fn rport(&self) -> Option<u16> {
        self.params.get("rport").and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} {}",
            self.protocol_name, self.protocol_version, self.transport, self.host
        )?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        self.params.write_to(f, ';', ';')
    }
}

/// SIP 头部
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Via(ViaHeader),
    From(NameAddr),
    To(NameAddr),
    /// 一行可携带多个逗号分隔的地址，保持原顺序
    Contact(Vec<NameAddr>),
    Route(Vec<NameAddr>),
    RecordRoute(Vec<NameAddr>),
    CSeq { seq: u32, method: Method },
    CallId(String),
    ContentType(String),
    ContentLength(u32),
    MaxForwards(u32),
    Expires(u32),
    Other { name: String, value: String },
}

impl Header {
    pub fn other(name: impl Into<String>, value: impl Into<String>) -> Self {
        Header::Other {
            name: name.into(),
            value: value.into(),
        }
    }

    /// 规范头部名
    pub fn name(&self) -> &str {
        match self {
            Header::Via(_) => "Via",
            Header::From(_) => "From",
            Header::To(_) => "To",
            Header::Contact(_) => "Contact",
            Header::Route(_) => "Route",
            Header::RecordRoute(_) => "Record-Route",
            Header::CSeq { .. } => "CSeq",
            Header::CallId(_) => "Call-ID",
            Header::ContentType(_) => "Content-Type",
            Header::ContentLength(_) => "Content-Length",
            Header::MaxForwards(_) => "Max-Forwards",
            Header::Expires(_) => "Expires",
            Header::Other { name, .. } => name,
        }
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name)
    }

    /// 头部值的线上文本
    pub fn value(&self) -> String {
        match self {
            Header::Via(via) => via.to_string(),
            Header::From(addr) | Header::To(addr) => addr.to_string(),
            Header::Contact(list) | Header::Route(list) | Header::RecordRoute(list) => list
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            Header::CSeq { seq, method } => format!("{} {}", seq, method),
            Header::CallId(v) | Header::ContentType(v) => v.clone(),
            Header::ContentLength(v) | Header::MaxForwards(v) | Header::Expires(v) => v.to_string(),
            Header::Other { value, .. } => value.clone(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.value())
    }
}
