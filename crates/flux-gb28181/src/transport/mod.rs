// 传输层
// 当前只实现 UDP；按传输名选择底层实现

pub mod conn;
pub mod udp;

pub use conn::{Connection, MessageHandler};
pub use udp::{UdpConnection, UdpTransport};

use crate::{Result, SipError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct TransportLayer {
    udp: UdpTransport,
}

impl TransportLayer {
    /// 绑定 SIP 端口；失败是服务启动时唯一的致命错误
    pub async fn bind(addr: &str) -> Result<Self> {
        Ok(Self {
            udp: UdpTransport::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    /// 按传输名取得连接，引用计数加一
    pub async fn get_connection(&self, transport: &str, addr: SocketAddr) -> Result<Arc<dyn Connection>> {
        match transport.to_ascii_uppercase().as_str() {
            "UDP" => {
                let conn: Arc<dyn Connection> = self.udp.connection(addr).await;
                Ok(conn)
            }
            other => Err(SipError::Transport(format!("unsupported transport {}", other))),
        }
    }

    pub async fn serve(&self, handler: Arc<dyn MessageHandler>, cancel: CancellationToken) -> Result<()> {
        self.udp.serve(handler, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_connection_by_transport_name() {
        let layer = TransportLayer::bind("127.0.0.1:0").await.unwrap();
        let remote: SocketAddr = "127.0.0.1:5070".parse().unwrap();

        let conn = layer.get_connection("udp", remote).await.unwrap();
        assert_eq!(conn.remote_addr(), remote);
        assert_eq!(conn.transport(), "UDP");

        let err = layer.get_connection("TCP", remote).await.err().unwrap();
        assert!(matches!(err, SipError::Transport(_)));
    }
}
