// SIP 协议引擎
// URI 状态机解析、头部与报文模型、请求构造、会话定时器与状态机

pub mod builder;
pub mod header;
pub mod message;
pub mod params;
pub mod parse;
pub mod state;
pub mod timer;
pub mod uri;

pub use builder::{
    new_ack_request, new_cancel_request, new_catalog_request, new_invite_request,
    new_response_from_request,
};
pub use header::{Header, Method, NameAddr, ViaHeader};
pub use message::{default_port, Headers, Message, Request, Response};
pub use params::HeaderParams;
pub use parse::{parse_address_list, parse_address_value, parse_cseq, parse_message};
pub use state::{InviteState, InviteTrigger, SessionState, SessionTrigger};
pub use timer::SessionTimer;
pub use uri::{parse_uri, Uri, UriState};
