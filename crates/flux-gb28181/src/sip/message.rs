// SIP 消息模型
// 有序头部集合、Request / Response 以及逐字节一致的序列化

use super::header::{Header, Method, NameAddr, ViaHeader};
use super::parse::parse_message;
use super::uri::Uri;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

pub const SIP_VERSION: &str = "SIP/2.0";

/// 传输协议的默认端口
pub fn default_port(transport: &str) -> u16 {
    match transport.to_ascii_uppercase().as_str() {
        "TLS" => 5061,
        "WS" => 80,
        "WSS" => 443,
        _ => 5060,
    }
}

/// 拼接 `host:port`，IPv6 字面量补方括号
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// 有序头部集合（保持插入顺序，允许重复）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 第一个同名头部（大小写不敏感）
    pub fn get(&self, name: &str) -> Option<&Header> {
        self.0.iter().find(|h| h.is_named(name))
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Header> + 'a {
        self.0.iter().filter(move |h| h.is_named(name))
    }

    /// 删除所有同名头部，返回删除数量
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !h.is_named(name));
        before - self.0.len()
    }

    /// 顶层 Via
    pub fn via(&self) -> Option<&ViaHeader> {
        self.vias().next()
    }

    pub fn via_mut(&mut self) -> Option<&mut ViaHeader> {
        self.0.iter_mut().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    pub fn vias(&self) -> impl Iterator<Item = &ViaHeader> {
        self.0.iter().filter_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    pub fn from(&self) -> Option<&NameAddr> {
        self.0.iter().find_map(|h| match h {
            Header::From(addr) => Some(addr),
            _ => None,
        })
    }

    pub fn to(&self) -> Option<&NameAddr> {
        self.0.iter().find_map(|h| match h {
            Header::To(addr) => Some(addr),
            _ => None,
        })
    }

    pub fn call_id(&self) -> Option<&str> {
        self.0.iter().find_map(|h| match h {
            Header::CallId(id) => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        self.0.iter().find_map(|h| match h {
            Header::CSeq { seq, method } => Some((*seq, *method)),
            _ => None,
        })
    }

    /// 第一个 Contact 的第一项
    pub fn contact(&self) -> Option<&NameAddr> {
        self.0.iter().find_map(|h| match h {
            Header::Contact(list) => list.first(),
            _ => None,
        })
    }

    /// 所有 Route 项（按头部顺序展开）
    pub fn routes(&self) -> impl Iterator<Item = &NameAddr> {
        self.0.iter().flat_map(route_entries)
    }

    pub fn content_length(&self) -> Option<u32> {
        self.0.iter().find_map(|h| match h {
            Header::ContentLength(len) => Some(*len),
            _ => None,
        })
    }

    pub fn content_type(&self) -> Option<&str> {
        self.0.iter().find_map(|h| match h {
            Header::ContentType(v) => Some(v.as_str()),
            _ => None,
        })
    }

    fn write_to(&self, buf: &mut BytesMut) {
        for header in &self.0 {
            buf.put_slice(header.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn route_entries(header: &Header) -> &[NameAddr] {
    match header {
        Header::Route(list) => list,
        _ => &[],
    }
}

/// 写出头部之后的部分：有消息体时空行 + 消息体 + CRLF，否则只有结尾 CRLF
fn write_body(buf: &mut BytesMut, body: Option<&Bytes>) {
    if let Some(body) = body {
        buf.put_slice(b"\r\n");
        buf.put_slice(body);
    }
    buf.put_slice(b"\r\n");
}

fn via_host_port(via: &ViaHeader, transport: &str) -> String {
    let host = via.received().unwrap_or(&via.host);
    let port = via
        .rport()
        .or(via.port)
        .unwrap_or_else(|| default_port(transport));
    join_host_port(host, port)
}

/// SIP 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub recipient: Uri,
    pub sip_version: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    transport: Option<String>,
    source: Option<String>,
    destination: Option<String>,
}

impl Request {
    pub fn new(method: Method, recipient: Uri) -> Self {
        Self {
            method,
            recipient,
            sip_version: SIP_VERSION.to_string(),
            headers: Headers::new(),
            body: None,
            transport: None,
            source: None,
            destination: None,
        }
    }

    /// 设置消息体，并保持唯一的 Content-Length
    pub fn set_body(&mut self, body: Option<Bytes>) {
        let len = body.as_ref().map(|b| b.len() as u32).unwrap_or(0);
        self.headers.remove("Content-Length");
        self.headers.push(Header::ContentLength(len));
        self.body = body;
    }

    /// 下一跳目标 URI：顶层 Route，否则 Request-URI
    fn target_uri(&self) -> &Uri {
        self.headers
            .routes()
            .next()
            .map(|r| &r.uri)
            .unwrap_or(&self.recipient)
    }

    pub fn transport(&self) -> String {
        if let Some(transport) = &self.transport {
            return transport.clone();
        }

        let mut transport = self
            .headers
            .via()
            .map(|v| v.transport.to_ascii_uppercase())
            .unwrap_or_else(|| "UDP".to_string());

        let target = self.target_uri();
        if let Some(param) = target.transport_param() {
            transport = param.to_ascii_uppercase();
        }

        if target.encrypted {
            transport = match transport.as_str() {
                "TCP" => "TLS".to_string(),
                "WS" => "WSS".to_string(),
                _ => transport,
            };
        }

        transport
    }

    pub fn set_transport(&mut self, transport: impl Into<String>) {
        self.transport = Some(transport.into());
    }

    /// 请求来源 `host:port`：显式值优先，否则由顶层 Via 推导
    pub fn source(&self) -> String {
        if let Some(source) = &self.source {
            return source.clone();
        }

        let transport = self.transport();
        match self.headers.via() {
            Some(via) => via_host_port(via, &transport),
            None => String::new(),
        }
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    /// 请求目的 `host:port`：显式值优先，否则取顶层 Route 或 Request-URI
    pub fn destination(&self) -> String {
        if let Some(destination) = &self.destination {
            return destination.clone();
        }

        let target = self.target_uri();
        let port = target
            .port
            .unwrap_or_else(|| default_port(&self.transport()));
        join_host_port(&target.host, port)
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = Some(destination.into());
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(format!("{} {} {}\r\n", self.method, self.recipient, self.sip_version).as_bytes());
        self.headers.write_to(&mut buf);
        write_body(&mut buf, self.body.as_ref());
        buf.freeze()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// SIP 响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub sip_version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    transport: Option<String>,
    source: Option<String>,
    destination: Option<String>,
}

impl Response {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            sip_version: SIP_VERSION.to_string(),
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
            body: None,
            transport: None,
            source: None,
            destination: None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn set_body(&mut self, body: Option<Bytes>) {
        let len = body.as_ref().map(|b| b.len() as u32).unwrap_or(0);
        self.headers.remove("Content-Length");
        self.headers.push(Header::ContentLength(len));
        self.body = body;
    }

    pub fn transport(&self) -> String {
        if let Some(transport) = &self.transport {
            return transport.clone();
        }

        self.headers
            .via()
            .map(|v| v.transport.to_ascii_uppercase())
            .unwrap_or_else(|| "UDP".to_string())
    }

    pub fn set_transport(&mut self, transport: impl Into<String>) {
        self.transport = Some(transport.into());
    }

    /// 收到该响应的对端地址（由传输层写入）
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    /// 响应目的地：显式值优先，否则按顶层 Via（received / rport 修正）
    pub fn destination(&self) -> String {
        if let Some(destination) = &self.destination {
            return destination.clone();
        }

        let transport = self.transport();
        match self.headers.via() {
            Some(via) => via_host_port(via, &transport),
            None => String::new(),
        }
    }

    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.destination = Some(destination.into());
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(format!("{} {} {}\r\n", self.sip_version, self.status_code, self.reason).as_bytes());
        self.headers.write_to(&mut buf);
        write_body(&mut buf, self.body.as_ref());
        buf.freeze()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// SIP 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// 从数据报解码
    pub fn decode(data: &[u8]) -> Result<Self> {
        parse_message(data)
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(req) => &req.headers,
            Message::Response(resp) => &resp.headers,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers().call_id()
    }

    pub fn transport(&self) -> String {
        match self {
            Message::Request(req) => req.transport(),
            Message::Response(resp) => resp.transport(),
        }
    }

    pub fn set_transport(&mut self, transport: impl Into<String>) {
        match self {
            Message::Request(req) => req.set_transport(transport),
            Message::Response(resp) => resp.set_transport(transport),
        }
    }

    pub fn set_source(&mut self, source: impl Into<String>) {
        match self {
            Message::Request(req) => req.set_source(source),
            Message::Response(resp) => resp.set_source(source),
        }
    }

    pub fn destination(&self) -> String {
        match self {
            Message::Request(req) => req.destination(),
            Message::Response(resp) => resp.destination(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(req) => req.to_bytes(),
            Message::Response(resp) => resp.to_bytes(),
        }
    }

    /// 日志用的简短描述，如 `REGISTER` 或 `200 OK`
    pub fn short(&self) -> String {
        match self {
            Message::Request(req) => req.method.to_string(),
            Message::Response(resp) => format!("{} {}", resp.status_code, resp.reason),
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(req) => req.fmt(f),
            Message::Response(resp) => resp.fmt(f),
        }
    }
}
