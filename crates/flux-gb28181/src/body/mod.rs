// 消息体：MANSCDP XML 与 GB28181 SDP

pub mod manscdp;
pub mod sdp;

pub use manscdp::{CatalogItem, CatalogQuery, ManscdpMessage};
pub use sdp::{generate_ssrc, SdpSession, SessionKind};
