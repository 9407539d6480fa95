// UDP 传输
// 单个 socket 承载所有设备；按远端地址分配共享该 socket 的连接

use super::conn::{Connection, MessageHandler};
use crate::sip::Message;
use crate::{Result, SipError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// 单个数据报上限
const MAX_DATAGRAM: usize = 65535;

/// 日志中原文预览的最大长度
const PREVIEW_LEN: usize = 256;

type ConnectionMap = Arc<Mutex<HashMap<SocketAddr, Arc<UdpConnection>>>>;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    connections: ConnectionMap,
}

impl UdpTransport {
    /// 绑定 UDP 端口
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            SipError::Transport(format!("Failed to bind UDP socket {}: {}", addr, e))
        })?;
        let local_addr = socket.local_addr()?;

        tracing::info!(target: "gb28181::transport", %local_addr, "UDP transport bound");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 取得到 `remote` 的连接（不存在则创建），引用计数加一
    pub async fn connection(&self, remote: SocketAddr) -> Arc<UdpConnection> {
        let mut connections = self.connections.lock().await;
        let conn = connections
            .entry(remote)
            .or_insert_with(|| {
                Arc::new(UdpConnection {
                    socket: self.socket.clone(),
                    remote,
                    refs: AtomicI32::new(0),
                    connections: self.connections.clone(),
                })
            })
            .clone();
        conn.reference(1);
        conn
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// 接收循环：解码数据报并交给处理器，直到取消
    pub async fn serve(&self, handler: Arc<dyn MessageHandler>, cancel: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        tracing::info!(target: "gb28181::transport", local_addr = %self.local_addr, "UDP listener started");

        loop {
            let (len, remote) = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(target: "gb28181::transport", "UDP listener stopped");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!(target: "gb28181::transport", error = %e, "Failed to receive UDP packet");
                        continue;
                    }
                },
            };

            let data = &buf[..len];

            // 设备常发送纯 CRLF 作为 NAT 保活
            if data.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            match Message::decode(data) {
                Ok(mut msg) => {
                    msg.set_transport("UDP");
                    msg.set_source(remote.to_string());

                    tracing::debug!(
                        target: "gb28181::transport",
                        %remote,
                        bytes = len,
                        message = %msg.short(),
                        "Received SIP message"
                    );

                    handler.handle(msg).await;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "gb28181::transport",
                        %remote,
                        error = %e,
                        preview = %preview(data),
                        "Dropping undecodable datagram"
                    );
                }
            }
        }
    }
}

fn preview(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(&data[..data.len().min(PREVIEW_LEN)]);
    text.replace("\r\n", "\\r\\n")
}

/// 共享 UDP socket 的逻辑连接
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    refs: AtomicI32,
    connections: ConnectionMap,
}

impl UdpConnection {
    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for UdpConnection {
    async fn write_msg(&self, msg: &Message) -> Result<()> {
        let destination = msg.destination();
        let data = msg.to_bytes();

        let sent = if destination.is_empty() {
            self.socket.send_to(&data, self.remote).await?
        } else {
            self.socket.send_to(&data, destination.as_str()).await?
        };

        if sent != data.len() {
            return Err(SipError::Transport(format!(
                "short write to {}: {} of {} bytes",
                destination,
                sent,
                data.len()
            )));
        }

        tracing::debug!(
            target: "gb28181::transport",
            %destination,
            bytes = sent,
            message = %msg.short(),
            "Sent SIP message"
        );

        Ok(())
    }

    fn reference(&self, delta: i32) {
        self.refs.fetch_add(delta, Ordering::SeqCst);
    }

    async fn try_close(&self) -> Result<i32> {
        let mut connections = self.connections.lock().await;
        let remaining = self.refs.fetch_sub(1, Ordering::SeqCst) - 1;

        if remaining <= 0 {
            connections.remove(&self.remote);
            tracing::debug!(target: "gb28181::transport", remote = %self.remote, "UDP connection released");
        }

        Ok(remaining.max(0))
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn transport(&self) -> &'static str {
        "UDP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connections_are_shared_and_released() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let remote: SocketAddr = "127.0.0.1:15060".parse().unwrap();

        let first = transport.connection(remote).await;
        let second = transport.connection(remote).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.refs(), 2);
        assert_eq!(transport.connection_count().await, 1);

        assert_eq!(first.try_close().await.unwrap(), 1);
        assert_eq!(transport.connection_count().await, 1);
        assert_eq!(second.try_close().await.unwrap(), 0);
        assert_eq!(transport.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_an_error() {
        assert!(UdpTransport::bind("not-an-address").await.is_err());
    }

    #[test]
    fn test_preview_escapes_crlf() {
        assert_eq!(preview(b"REGISTER\r\nVia"), "REGISTER\\r\\nVia");
    }
}
