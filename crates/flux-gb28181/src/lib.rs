// GB28181 SIP 信令服务
// 设备注册、心跳保活、目录查询与实时点播的平台侧实现

pub mod body;
pub mod config;
pub mod error;
pub mod server;
pub mod sip;
pub mod transport;

pub use config::SipServerConfig;
pub use error::{Result, SipError};
pub use server::{SessionSnapshot, SipServer};
