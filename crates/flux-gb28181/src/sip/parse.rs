// SIP 头部值与报文解析

use super::header::{Header, Method, NameAddr, ViaHeader};
use super::message::{Headers, Message, Request, Response};
use super::params::HeaderParams;
use super::uri::parse_uri;
use crate::{Result, SipError};
use bytes::Bytes;

/// CSeq 序号上限 2^31 - 1
const MAX_CSEQ: u64 = (1 << 31) - 1;

/// 解析单个地址值（From / To / Contact 的一项）
///
/// 单遍扫描，跟踪引号和尖括号：`<` 之前的文本是显示名（引号可选），
/// `<...>` 内是 URI，括号外的 `;key=value` 是头部参数；
/// 没有尖括号时第一个 `;` 结束 URI。括号和引号外的 `*` 得到通配 URI。
pub fn parse_address_value(text: &str) -> Result<NameAddr> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SipError::parse("address", text, "empty address"));
    }

    let mut in_quote = false;
    let mut escaped = false;
    let mut quote_seen = false;
    let mut lt: Option<usize> = None;
    let mut gt: Option<usize> = None;
    let mut semicolon: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if in_quote {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_quote = false,
                _ => escaped = false,
            }
            continue;
        }

        match c {
            '"' if lt.is_none() => {
                in_quote = true;
                quote_seen = true;
            }
            '<' if lt.is_none() => lt = Some(i),
            '>' if lt.is_some() && gt.is_none() => gt = Some(i),
            ';' if lt.is_none() || gt.is_some() => {
                semicolon = Some(i);
                break;
            }
            _ => {}
        }
    }

    if in_quote {
        return Err(SipError::parse("address", text, "unterminated quoted display name"));
    }

    let (display_name, uri_text, tail) = match (lt, gt) {
        (Some(l), Some(g)) => {
            let display = unquote(text[..l].trim());
            (display, &text[l + 1..g], text[g + 1..].trim())
        }
        (Some(_), None) => {
            return Err(SipError::parse("address", text, "missing closing '>'"));
        }
        (None, _) => {
            if quote_seen {
                return Err(SipError::parse("address", text, "display name without <uri>"));
            }
            let end = semicolon.unwrap_or(text.len());
            (None, text[..end].trim(), &text[end..])
        }
    };

    let uri = parse_uri(uri_text)?;

    let mut params = HeaderParams::new();
    if !tail.is_empty() {
        if !tail.starts_with(';') {
            return Err(SipError::parse("address", text, "unexpected text after uri"));
        }
        params.decode_into(&tail[1..], ';', None)?;
    }

    Ok(NameAddr {
        display_name,
        uri,
        params,
    })
}

fn unquote(display: &str) -> Option<String> {
    let inner = if display.len() >= 2 && display.starts_with('"') && display.ends_with('"') {
        &display[1..display.len() - 1]
    } else {
        display
    };

    let inner = inner.trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

/// 按顶层逗号切分（不在引号、尖括号或 IPv6 方括号内）
///
/// 末尾追加一个逗号，使最后一段与其它段走同一分支。
fn split_top_level(text: &str) -> Vec<String> {
    let mut owned = String::with_capacity(text.len() + 1);
    owned.push_str(text);
    owned.push(',');

    let mut sections = Vec::new();
    let mut in_quote = false;
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in owned.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '<' | '[' if !in_quote => depth += 1,
            '>' | ']' if !in_quote => depth = depth.saturating_sub(1),
            ',' if !in_quote && depth == 0 => {
                let section = owned[start..i].trim();
                if !section.is_empty() {
                    sections.push(section.to_string());
                }
                start = i + 1;
            }
            _ => {}
        }
    }

    sections
}

/// 解析地址列表（Contact / Route / Record-Route）
pub fn parse_address_list(text: &str) -> Result<Vec<NameAddr>> {
    let entries = split_top_level(text)
        .iter()
        .map(|section| parse_address_value(section))
        .collect::<Result<Vec<_>>>()?;

    if entries.is_empty() {
        return Err(SipError::parse("address-list", text, "no address"));
    }

    Ok(entries)
}

/// 解析 CSeq：恰好一个 `seq method` 对
pub fn parse_cseq(text: &str) -> Result<(u32, Method)> {
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() != 2 {
        return Err(SipError::parse("cseq", text, "expected `<seq> <method>`"));
    }

    let seq: u64 = parts[0]
        .parse()
        .map_err(|_| SipError::parse("cseq", text, "sequence is not a number"))?;
    if seq > MAX_CSEQ {
        return Err(SipError::parse("cseq", text, "sequence exceeds 2^31-1"));
    }

    let method = Method::from_str(parts[1])
        .ok_or_else(|| SipError::parse("cseq", text, "unknown method"))?;

    Ok((seq as u32, method))
}

fn parse_u32(context: &str, text: &str) -> Result<u32> {
    text.trim()
        .parse::<u32>()
        .map_err(|e| SipError::parse(context, text, e.to_string()))
}

/// 解析 Via：每个逗号分隔的跳各自成为一个头部
pub fn parse_via_list(text: &str) -> Result<Vec<ViaHeader>> {
    let hops = split_top_level(text)
        .iter()
        .map(|hop| parse_via_hop(hop))
        .collect::<Result<Vec<_>>>()?;

    if hops.is_empty() {
        return Err(SipError::parse("via", text, "empty via"));
    }

    Ok(hops)
}

fn parse_via_hop(text: &str) -> Result<ViaHeader> {
    let text = text.trim();
    let split = text
        .find(|c: char| c.is_ascii_whitespace())
        .ok_or_else(|| SipError::parse("via", text, "missing sent-by"))?;

    let protocol: Vec<&str> = text[..split].split('/').map(str::trim).collect();
    if protocol.len() != 3 || protocol.iter().any(|p| p.is_empty()) {
        return Err(SipError::parse("via", text, "malformed sent-protocol"));
    }

    let rest = text[split..].trim();
    let (sent_by, params_text) = match rest.find(';') {
        Some(pos) => (rest[..pos].trim(), &rest[pos + 1..]),
        None => (rest, ""),
    };

    let (host, port) = split_host_port(sent_by)
        .map_err(|reason| SipError::parse("via", text, reason))?;

    let mut via = ViaHeader {
        protocol_name: protocol[0].to_string(),
        protocol_version: protocol[1].to_string(),
        transport: protocol[2].to_ascii_uppercase(),
        host,
        port,
        params: HeaderParams::new(),
    };
    via.params.decode_into(params_text, ';', None)?;

    Ok(via)
}

fn split_host_port(text: &str) -> std::result::Result<(String, Option<u16>), String> {
    let (host, port_text) = if text.starts_with('[') {
        let end = text.find(']').ok_or("unterminated ipv6 host")?;
        let after = &text[end + 1..];
        let port = after.strip_prefix(':');
        if port.is_none() && !after.is_empty() {
            return Err("unexpected text after ipv6 host".to_string());
        }
        (&text[..=end], port)
    } else {
        match text.find(':') {
            Some(pos) => (&text[..pos], Some(&text[pos + 1..])),
            None => (text, None),
        }
    };

    if host.is_empty() {
        return Err("missing host".to_string());
    }

    let port = port_text
        .map(|p| p.trim().parse::<u16>().map_err(|e| format!("invalid port: {}", e)))
        .transpose()?;

    Ok((host.to_string(), port))
}

/// 紧凑头部名展开为规范名
pub fn canonical_name(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "m" | "M" => "Contact",
        "i" | "I" => "Call-ID",
        "c" | "C" => "Content-Type",
        "l" | "L" => "Content-Length",
        other => other,
    }
}

/// 解析一行头部；Via 多跳会得到多个头部
pub fn parse_header(name: &str, value: &str) -> Result<Vec<Header>> {
    let name = canonical_name(name.trim());
    let value = value.trim();

    let header = match name.to_ascii_lowercase().as_str() {
        "via" => {
            return Ok(parse_via_list(value)?.into_iter().map(Header::Via).collect());
        }
        "from" | "to" => {
            let addr = parse_address_value(value)?;
            if addr.uri.wildcard {
                return Err(SipError::parse(name, value, "wildcard uri only permitted in Contact"));
            }
            if name.eq_ignore_ascii_case("from") {
                Header::From(addr)
            } else {
                Header::To(addr)
            }
        }
        "contact" => Header::Contact(parse_address_list(value)?),
        "route" => Header::Route(parse_address_list(value)?),
        "record-route" => Header::RecordRoute(parse_address_list(value)?),
        "cseq" => {
            let (seq, method) = parse_cseq(value)?;
            Header::CSeq { seq, method }
        }
        "call-id" => Header::CallId(value.to_string()),
        "content-type" => Header::ContentType(value.to_string()),
        "content-length" => Header::ContentLength(parse_u32("content-length", value)?),
        "max-forwards" => Header::MaxForwards(parse_u32("max-forwards", value)?),
        // 非法值原样保留，由会话层决定如何处理
        "expires" => match value.parse::<u32>() {
            Ok(v) => Header::Expires(v),
            Err(_) => Header::other("Expires", value),
        },
        _ => Header::other(name, value),
    };

    Ok(vec![header])
}

/// 解析一个完整的 SIP 报文（一个 UDP 数据报）
pub fn parse_message(data: &[u8]) -> Result<Message> {
    let (head, rest) = split_head_body(data);
    let head = String::from_utf8_lossy(head);

    let mut lines = unfold_lines(&head).into_iter();

    let start_line = lines
        .next()
        .ok_or_else(|| SipError::parse("message", head.as_ref(), "empty message"))?;

    let mut headers = Headers::new();
    for line in lines {
        let colon = line
            .find(':')
            .ok_or_else(|| SipError::parse("header", line.as_str(), "missing ':'"))?;
        for header in parse_header(&line[..colon], &line[colon + 1..])? {
            headers.push(header);
        }
    }

    let body = match headers.content_length() {
        Some(len) => {
            let len = len as usize;
            if rest.len() < len {
                return Err(SipError::parse(
                    "message",
                    start_line.as_str(),
                    format!("body has {} bytes, Content-Length is {}", rest.len(), len),
                ));
            }
            &rest[..len]
        }
        None => rest,
    };
    let body = (!body.is_empty()).then(|| Bytes::copy_from_slice(body));

    if start_line.starts_with("SIP/") {
        parse_status_line(&start_line, headers, body).map(Message::Response)
    } else {
        parse_request_line(&start_line, headers, body).map(Message::Request)
    }
}

fn split_head_body(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find_subslice(data, b"\r\n\r\n") {
        return (&data[..pos], &data[pos + 4..]);
    }
    if let Some(pos) = find_subslice(data, b"\n\n") {
        return (&data[..pos], &data[pos + 2..]);
    }
    (data, &[])
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// 去掉前导空行，并把以空白开头的续行接到上一行
fn unfold_lines(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();

    for raw in head.split('\n') {
        let line = raw.trim_end_matches('\r');
        if lines.is_empty() && line.trim().is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }

        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }

    lines
}

fn parse_request_line(line: &str, headers: Headers, body: Option<Bytes>) -> Result<Request> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(SipError::parse("request-line", line, "expected `<method> <uri> <version>`"));
    }

    let method = Method::from_str(parts[0])
        .ok_or_else(|| SipError::parse("request-line", line, "unsupported method"))?;
    let recipient = parse_uri(parts[1])?;
    if !parts[2].starts_with("SIP/") {
        return Err(SipError::parse("request-line", line, "bad sip version"));
    }

    let mut req = Request::new(method, recipient);
    req.sip_version = parts[2].to_string();
    req.headers = headers;
    req.body = body;
    Ok(req)
}

fn parse_status_line(line: &str, headers: Headers, body: Option<Bytes>) -> Result<Response> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let status_code = parts
        .next()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .filter(|code| (100..700).contains(code))
        .ok_or_else(|| SipError::parse("status-line", line, "invalid status code"))?;
    let reason = parts.next().unwrap_or_default().trim();

    let mut resp = Response::new(status_code, reason);
    resp.sip_version = version.to_string();
    resp.headers = headers;
    resp.body = body;
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_with_quoted_display_name() {
        let addr =
            parse_address_value("\"Camera <1>\" <sip:34020000001320000001@3402000000>;tag=abc")
                .unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Camera <1>"));
        assert_eq!(addr.uri.user(), Some("34020000001320000001"));
        assert_eq!(addr.tag(), Some("abc"));
    }

    #[test]
    fn test_address_unquoted_display_name() {
        let addr = parse_address_value("Alice <sip:alice@example.com>").unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
        assert_eq!(addr.uri.host, "example.com");
    }

    #[test]
    fn test_address_without_brackets_semicolon_ends_uri() {
        let addr = parse_address_value("sip:alice@example.com;tag=88").unwrap();
        assert_eq!(addr.uri.to_string(), "sip:alice@example.com");
        assert!(addr.uri.uri_params.is_empty());
        assert_eq!(addr.tag(), Some("88"));
    }

    #[test]
    fn test_address_params_inside_brackets_belong_to_uri() {
        let addr = parse_address_value("<sip:proxy.example.com;lr>;x=1").unwrap();
        assert!(addr.uri.uri_params.contains("lr"));
        assert_eq!(addr.params.get("x"), Some("1"));
    }

    #[test]
    fn test_address_wildcard() {
        let addr = parse_address_value("*").unwrap();
        assert!(addr.uri.wildcard);
    }

    #[test]
    fn test_contact_list_keeps_order_and_params() {
        let list = parse_address_list("<sip:a@b>,<sip:c@d>;tag=1").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].uri.to_string(), "sip:a@b");
        assert!(list[0].params.is_empty());
        assert_eq!(list[1].uri.to_string(), "sip:c@d");
        assert_eq!(list[1].tag(), Some("1"));
    }

    #[test]
    fn test_address_list_ignores_commas_in_quotes() {
        let list = parse_address_list("\"Doe, John\" <sip:j@d>, <sip:k@d>").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].display_name.as_deref(), Some("Doe, John"));
    }

    #[test]
    fn test_from_rejects_wildcard() {
        assert!(parse_header("From", "*").is_err());
        assert!(parse_header("Contact", "*").is_ok());
    }

    #[test]
    fn test_cseq_bounds() {
        assert_eq!(parse_cseq("20 MESSAGE").unwrap(), (20, Method::Message));
        assert_eq!(parse_cseq("2147483647 INVITE").unwrap().0, 2147483647);
        assert!(parse_cseq("2147483648 INVITE").is_err());
        assert!(parse_cseq("1 INVITE extra").is_err());
        assert!(parse_cseq("INVITE").is_err());
    }

    #[test]
    fn test_via_multiple_hops() {
        let headers = parse_header(
            "Via",
            "SIP/2.0/UDP 192.168.10.8:60719;rport=60719;branch=z9hG4bK1, SIP/2.0/tcp proxy.example.com",
        )
        .unwrap();
        assert_eq!(headers.len(), 2);

        let Header::Via(first) = &headers[0] else {
            panic!("expected via");
        };
        assert_eq!(first.transport, "UDP");
        assert_eq!(first.port, Some(60719));
        assert_eq!(first.rport(), Some(60719));
        assert_eq!(first.branch(), Some("z9hG4bK1"));

        let Header::Via(second) = &headers[1] else {
            panic!("expected via");
        };
        assert_eq!(second.transport, "TCP");
        assert_eq!(second.port, None);
    }

    #[test]
    fn test_compact_names_and_unparsable_expires() {
        let headers = parse_header("l", "12").unwrap();
        assert_eq!(headers[0], Header::ContentLength(12));

        let headers = parse_header("Expires", "soon").unwrap();
        assert_eq!(headers[0], Header::other("Expires", "soon"));
    }

    #[test]
    fn test_parse_keepalive_message() {
        let raw = "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.10.8:60719;rport=60719;branch=z9hG4bK430967578\r\n\
Max-Forwards: 70\r\n\
To: <sip:34020000002000000001@3402000000>\r\n\
From: <sip:34020000002000000719@3402000000>;tag=1555083253\r\n\
Call-ID: 1910992793\r\n\
CSeq: 20 MESSAGE\r\n\
Content-Type: Application/MANSCDP+xml\r\n\
User-Agent: IP Camera\r\n\
Content-Length: 5\r\n\
\r\n\
hello\r\n";

        let Message::Request(req) = parse_message(raw.as_bytes()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.method, Method::Message);
        assert_eq!(req.headers.from().and_then(|f| f.uri.user()), Some("34020000002000000719"));
        assert_eq!(req.headers.cseq(), Some((20, Method::Message)));
        assert_eq!(req.body.as_deref(), Some(&b"hello"[..]));
        assert_eq!(
            req.headers.get("user-agent").map(|h| h.value()),
            Some("IP Camera".to_string())
        );
    }

    #[test]
    fn test_parse_folded_header_and_response() {
        let raw = "SIP/2.0 200 OK\r\nVia: SIP/2.0/UDP 10.0.0.1:5060\r\n ;branch=z9hG4bKx\r\nCall-ID: a\r\nContent-Length: 0\r\n\r\n";

        let Message::Response(resp) = parse_message(raw.as_bytes()).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.headers.via().and_then(|v| v.branch()), Some("z9hG4bKx"));
        assert!(resp.body.is_none());
    }

    #[test]
    fn test_short_body_is_an_error() {
        let raw = "MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 10\r\n\r\nabc";
        assert!(parse_message(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_missing_colon_is_an_error() {
        let raw = "OPTIONS sip:a@b SIP/2.0\r\nBroken header\r\n\r\n";
        assert!(parse_message(raw.as_bytes()).is_err());
    }
}
