// SIP 请求 / 响应构造
// INVITE、目录查询 MESSAGE、ACK（RFC 3261 13.2.2.4）、CANCEL 以及由请求生成响应

use super::header::{Header, Method, NameAddr, ViaHeader};
use super::message::{Request, Response};
use super::uri::Uri;
use bytes::Bytes;
use rand::Rng;

/// RFC 3261 magic cookie
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

pub const DEFAULT_MAX_FORWARDS: u32 = 70;

pub const CONTENT_TYPE_SDP: &str = "APPLICATION/SDP";
pub const CONTENT_TYPE_MANSCDP: &str = "Application/MANSCDP+xml";

/// 生成新的 Via branch
pub fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    format!("{}{:016x}", BRANCH_MAGIC_COOKIE, rng.gen::<u64>())
}

/// 生成 From / To tag
pub fn generate_tag() -> String {
    rand::thread_rng().gen_range(100_000_000u32..1_000_000_000).to_string()
}

/// 生成 Call-ID：`<random>@<host>`
pub fn generate_call_id(host: &str) -> String {
    format!("{:032x}@{}", rand::thread_rng().gen::<u128>(), host)
}

fn address_of(uri: &Uri) -> NameAddr {
    let mut addr = NameAddr::new(Uri {
        user: uri.user.clone(),
        host: uri.host.clone(),
        port: uri.port,
        ..Default::default()
    });
    addr.display_name = uri.user().map(str::to_ascii_uppercase);
    addr
}

fn new_outgoing_request(
    method: Method,
    sender: &Uri,
    recipient: &Uri,
    transport: &str,
    content_type: &str,
    body: Option<Bytes>,
) -> Request {
    let mut req = Request::new(method, recipient.clone());

    let mut via = ViaHeader::new(transport.to_ascii_uppercase(), sender.host.clone(), sender.port);
    via.set_branch(generate_branch());
    via.params.insert("rport", "");
    req.headers.push(Header::Via(via));

    req.headers
        .push(Header::From(address_of(sender).with_param("tag", generate_tag())));
    req.headers.push(Header::To(address_of(recipient)));
    req.headers.push(Header::MaxForwards(DEFAULT_MAX_FORWARDS));

    if body.is_some() {
        req.headers.push(Header::ContentType(content_type.to_string()));
    }

    req.headers
        .push(Header::Contact(vec![address_of(sender).with_param("expires", "3600")]));
    req.headers.push(Header::CallId(generate_call_id(&sender.host)));
    req.headers.push(Header::CSeq { seq: 1, method });

    req.set_body(body);
    req
}

/// 构造 INVITE（携带 SDP）
pub fn new_invite_request(
    sender: &Uri,
    recipient: &Uri,
    transport: &str,
    body: Option<Bytes>,
) -> Request {
    new_outgoing_request(Method::Invite, sender, recipient, transport, CONTENT_TYPE_SDP, body)
}

/// 构造目录查询 MESSAGE（携带 MANSCDP XML）
pub fn new_catalog_request(
    sender: &Uri,
    recipient: &Uri,
    transport: &str,
    body: Option<Bytes>,
) -> Request {
    new_outgoing_request(
        Method::Message,
        sender,
        recipient,
        transport,
        CONTENT_TYPE_MANSCDP,
        body,
    )
}

/// 为 INVITE 的最终响应构造 ACK
///
/// 2xx 的 ACK 是独立事务，需要新的 branch；非 2xx 沿用 INVITE 的 branch。
/// 路由集优先复制 INVITE 的 Route，否则由响应的 Record-Route 逆序得到。
pub fn new_ack_request(invite: &Request, response: &Response, body: Option<Bytes>) -> Request {
    let keep_recipient = invite
        .recipient
        .transport_param()
        .is_some_and(|t| t.to_ascii_lowercase().starts_with("ws"));

    let recipient = match response.headers.contact() {
        Some(contact) if !keep_recipient => contact.uri.clone(),
        _ => invite.recipient.clone(),
    };

    let mut ack = Request::new(Method::Ack, recipient);
    ack.sip_version = invite.sip_version.clone();

    for via in invite.headers.vias() {
        ack.headers.push(Header::Via(via.clone()));
    }
    if response.is_success() {
        if let Some(via) = ack.headers.via_mut() {
            via.set_branch(generate_branch());
        }
    }

    let routes: Vec<Header> = invite.headers.get_all("Route").cloned().collect();
    if routes.is_empty() {
        let record_routes: Vec<&Header> = response.headers.get_all("Record-Route").collect();
        for header in record_routes.into_iter().rev() {
            if let Header::RecordRoute(entries) = header {
                ack.headers
                    .push(Header::Route(entries.iter().rev().cloned().collect()));
            }
        }
    } else {
        for route in routes {
            ack.headers.push(route);
        }
    }

    ack.headers.push(Header::MaxForwards(DEFAULT_MAX_FORWARDS));

    if let Some(from) = invite.headers.from() {
        ack.headers.push(Header::From(from.clone()));
    }
    if let Some(to) = response.headers.to().or_else(|| invite.headers.to()) {
        ack.headers.push(Header::To(to.clone()));
    }
    if let Some(call_id) = invite.headers.call_id() {
        ack.headers.push(Header::CallId(call_id.to_string()));
    }
    if let Some((seq, _)) = invite.headers.cseq() {
        ack.headers.push(Header::CSeq {
            seq,
            method: Method::Ack,
        });
    }

    if body.is_some() {
        ack.headers.push(Header::ContentType(CONTENT_TYPE_SDP.to_string()));
    }
    ack.set_body(body);

    ack.set_transport(invite.transport());
    ack.set_source(invite.source());
    ack.set_destination(invite.destination());
    ack
}

/// 为尚未完成的请求构造 CANCEL
pub fn new_cancel_request(request: &Request) -> Request {
    let mut cancel = Request::new(Method::Cancel, request.recipient.clone());
    cancel.sip_version = request.sip_version.clone();

    if let Some(via) = request.headers.via() {
        cancel.headers.push(Header::Via(via.clone()));
    }
    for route in request.headers.get_all("Route") {
        cancel.headers.push(route.clone());
    }
    cancel.headers.push(Header::MaxForwards(DEFAULT_MAX_FORWARDS));

    if let Some(from) = request.headers.from() {
        cancel.headers.push(Header::From(from.clone()));
    }
    if let Some(to) = request.headers.to() {
        cancel.headers.push(Header::To(to.clone()));
    }
    if let Some(call_id) = request.headers.call_id() {
        cancel.headers.push(Header::CallId(call_id.to_string()));
    }
    if let Some((seq, _)) = request.headers.cseq() {
        cancel.headers.push(Header::CSeq {
            seq,
            method: Method::Cancel,
        });
    }
    cancel.set_body(None);

    cancel.set_transport(request.transport());
    cancel.set_source(request.source());
    cancel.set_destination(request.destination());
    cancel
}

/// 由请求生成响应
pub fn new_response_from_request(
    request: &Request,
    status_code: u16,
    reason: &str,
    body: Option<Bytes>,
) -> Response {
    let mut resp = Response::new(status_code, reason);
    resp.sip_version = request.sip_version.clone();

    for via in request.headers.vias() {
        resp.headers.push(Header::Via(via.clone()));
    }
    for record_route in request.headers.get_all("Record-Route") {
        resp.headers.push(record_route.clone());
    }
    if let Some(from) = request.headers.from() {
        resp.headers.push(Header::From(from.clone()));
    }
    if let Some(to) = request.headers.to() {
        let mut to = to.clone();
        if to.tag().is_none() && status_code > 100 {
            to.params.insert("tag", generate_tag());
        }
        resp.headers.push(Header::To(to));
    }
    if let Some(call_id) = request.headers.call_id() {
        resp.headers.push(Header::CallId(call_id.to_string()));
    }
    if let Some((seq, method)) = request.headers.cseq() {
        resp.headers.push(Header::CSeq { seq, method });
    }

    resp.set_body(body);
    resp.set_transport(request.transport());
    resp.set_destination(request.source());
    resp
}
