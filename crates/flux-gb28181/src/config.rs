// SIP 服务配置

use crate::{Result, SipError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;

/// 定时器周期上限（秒），一年
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 3600;

/// SIP 服务器配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SipServerConfig {
    /// 监听地址
    pub bind_addr: String,

    /// 平台 SIP ID（20 位国标编码）
    pub server_id: String,

    /// SIP 域（10 位）
    pub realm: String,

    /// 写入 Via / Contact / SDP 的本机地址；为空时自动探测
    pub local_ip: Option<String>,

    /// 首次注册等待时间（秒）
    pub register_timeout_secs: u64,

    /// REGISTER 的 Expires 无法解析时使用的有效期（秒）
    pub default_register_expires: u32,

    /// 心跳检测周期（秒）
    pub keepalive_interval_secs: u64,

    /// 允许连续丢失的心跳次数
    pub keepalive_max_timeouts: u32,

    /// 目录刷新周期（秒）
    pub catalog_interval_secs: u64,

    /// 收到目录后立即对所有通道发起点播
    pub pull_immediately: bool,

    /// SDP 中的媒体接收端口
    pub media_port: u16,
}

impl Default for SipServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5060".to_string(),
            server_id: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            local_ip: None,
            register_timeout_secs: 60,
            default_register_expires: 3600,
            keepalive_interval_secs: 60,
            keepalive_max_timeouts: 3,
            catalog_interval_secs: 600,
            pull_immediately: false,
            media_port: 30000,
        }
    }
}

impl SipServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server_id.len() != 20 || !self.server_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(SipError::Config(format!(
                "server_id must be a 20-digit code, got {:?}",
                self.server_id
            )));
        }

        if self.realm.len() != 10 || !self.realm.chars().all(|c| c.is_ascii_digit()) {
            return Err(SipError::Config(format!(
                "realm must be a 10-digit code, got {:?}",
                self.realm
            )));
        }

        if self.register_timeout_secs == 0
            || self.keepalive_interval_secs == 0
            || self.catalog_interval_secs == 0
        {
            return Err(SipError::Config("timer intervals must be greater than 0".to_string()));
        }

        let intervals = [
            ("register_timeout_secs", self.register_timeout_secs),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("catalog_interval_secs", self.catalog_interval_secs),
            ("default_register_expires", u64::from(self.default_register_expires)),
        ];
        if let Some((name, secs)) = intervals.iter().find(|(_, secs)| *secs > MAX_INTERVAL_SECS) {
            return Err(SipError::Config(format!(
                "{} must be at most {} seconds, got {}",
                name, MAX_INTERVAL_SECS, secs
            )));
        }

        Ok(())
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn catalog_interval(&self) -> Duration {
        Duration::from_secs(self.catalog_interval_secs)
    }

    /// 对外宣告的本机 IP
    ///
    /// 优先使用配置；监听在具体地址时用该地址；监听 0.0.0.0 时探测默认路由出口地址。
    pub fn resolve_local_ip(&self, bound: SocketAddr) -> String {
        if let Some(ip) = self.local_ip.as_ref().filter(|ip| !ip.is_empty()) {
            return ip.clone();
        }

        if !bound.ip().is_unspecified() {
            return bound.ip().to_string();
        }

        detect_outbound_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }
}

/// UDP connect 不发包，只用来让内核选出口地址
fn detect_outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
