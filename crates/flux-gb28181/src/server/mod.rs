// GB28181 SIP 服务器
// 传输层收到的消息按设备 ID 分发到各自的会话任务

pub mod channel;
pub mod registry;
pub mod session;

pub use channel::{merge_channels, ChannelSnapshot, SipChannel};
pub use registry::SessionRegistry;
pub use session::{SessionContext, SessionHandle, SessionSnapshot, SipSession};

use crate::config::SipServerConfig;
use crate::sip::{Message, Request, Response, Uri};
use crate::transport::{MessageHandler, TransportLayer};
use crate::{Result, SipError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// GB28181 SIP 服务器
pub struct SipServer {
    config: Arc<SipServerConfig>,
    transport: TransportLayer,
    registry: SessionRegistry,
    local_uri: Uri,
    cancel: CancellationToken,
    next_instance: AtomicU64,
}

impl SipServer {
    /// 校验配置并绑定 SIP 端口
    pub async fn new(config: SipServerConfig) -> Result<Self> {
        config.validate()?;

        let transport = TransportLayer::bind(&config.bind_addr).await?;
        let local_addr = transport.local_addr();
        let local_ip = config.resolve_local_ip(local_addr);
        let local_uri = Uri::sip(config.server_id.clone(), local_ip, Some(local_addr.port()));

        tracing::info!(
            target: "gb28181::sip",
            %local_addr,
            local_uri = %local_uri,
            "GB28181 SIP server created"
        );

        Ok(Self {
            config: Arc::new(config),
            transport,
            registry: SessionRegistry::new(),
            local_uri,
            cancel: CancellationToken::new(),
            next_instance: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn local_uri(&self) -> &Uri {
        &self.local_uri
    }

    pub fn config(&self) -> &SipServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// 取消后接收循环和所有会话都会退出
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 运行接收循环，直到 `shutdown`
    pub async fn start(self: Arc<Self>) -> Result<()> {
        tracing::info!(target: "gb28181::sip", "GB28181 SIP server started");

        let handler: Arc<dyn MessageHandler> = self.clone();
        self.transport.serve(handler, self.cancel.clone()).await
    }

    pub fn shutdown(&self) {
        tracing::info!(target: "gb28181::sip", "GB28181 SIP server shutting down");
        self.cancel.cancel();
    }

    /// 对设备通道发起实时点播
    pub async fn invite(&self, device_id: &str, channel_id: &str) -> Result<()> {
        self.session(device_id).await?.invite(channel_id).await
    }

    /// 立即向设备发送目录查询
    pub async fn query_catalog(&self, device_id: &str) -> Result<()> {
        self.session(device_id).await?.query_catalog().await
    }

    pub async fn session_info(&self, device_id: &str) -> Result<SessionSnapshot> {
        self.session(device_id).await?.snapshot().await
    }

    /// 所有活动会话的快照，按设备 ID 排序
    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots = Vec::new();
        for handle in self.registry.handles().await {
            if let Ok(snapshot) = handle.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        snapshots
    }

    async fn session(&self, device_id: &str) -> Result<SessionHandle> {
        self.registry
            .get(device_id)
            .await
            .ok_or_else(|| SipError::UnknownSession(device_id.to_string()))
    }

    async fn dispatch(&self, msg: Message) -> Result<()> {
        match msg {
            Message::Request(req) => self.dispatch_request(req).await,
            Message::Response(resp) => self.dispatch_response(resp).await,
        }
    }

    /// 请求按 From 用户分发，没有会话时创建
    async fn dispatch_request(&self, req: Request) -> Result<()> {
        let device_id = req
            .headers
            .from()
            .and_then(|from| from.uri.user())
            .map(str::to_string)
            .ok_or_else(|| SipError::ProtocolViolation("request without From user".to_string()))?;

        let handle = self
            .registry
            .get_or_create(&device_id, || self.create_session(&device_id, &req))
            .await?;

        handle.send_request(req).await
    }

    /// 响应按 To 用户分发，只投递给已有会话
    async fn dispatch_response(&self, resp: Response) -> Result<()> {
        let device_id = resp
            .headers
            .to()
            .and_then(|to| to.uri.user())
            .ok_or_else(|| SipError::ProtocolViolation("response without To user".to_string()))?;

        let handle = self
            .registry
            .get(device_id)
            .await
            .ok_or_else(|| SipError::UnknownSession(device_id.to_string()))?;

        handle.send_response(resp).await
    }

    async fn create_session(&self, device_id: &str, first: &Request) -> Result<SessionHandle> {
        let source = first.source();
        let remote: SocketAddr = source.parse().map_err(|_| {
            SipError::ProtocolViolation(format!("invalid source address {:?}", source))
        })?;

        let conn = self.transport.get_connection(&first.transport(), remote).await?;
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);

        let ctx = SessionContext {
            config: self.config.clone(),
            local_uri: self.local_uri.clone(),
            registry: self.registry.clone(),
        };
        let (session, handle) =
            SipSession::new(device_id, instance, ctx, conn, first, self.cancel.child_token());

        tokio::spawn(session.run());

        tracing::info!(target: "gb28181::sip", device_id, instance, %remote, "Session created");
        Ok(handle)
    }
}

#[async_trait]
impl MessageHandler for SipServer {
    async fn handle(&self, msg: Message) {
        let span = tracing::info_span!(
            "gb28181.sip.dispatch",
            message = %msg.short(),
            call_id = msg.call_id().unwrap_or_default()
        );

        if let Err(e) = self.dispatch(msg).instrument(span).await {
            tracing::warn!(target: "gb28181::sip", error = %e, "Failed to dispatch SIP message");
        }
    }
}
