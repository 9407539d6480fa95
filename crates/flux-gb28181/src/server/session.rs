// 设备会话
// 每个已注册设备一个任务：单消费者事件循环处理请求、响应、控制命令和三个定时器

use super::channel::{merge_channels, ChannelSnapshot, SipChannel};
use super::registry::SessionRegistry;
use crate::body::{generate_ssrc, CatalogQuery, ManscdpMessage, SdpSession, SessionKind};
use crate::config::SipServerConfig;
use crate::sip::{
    default_port, new_ack_request, new_cancel_request, new_catalog_request, new_invite_request,
    new_response_from_request, Header, InviteState, InviteTrigger, Message, Method, Request, Response,
    SessionState, SessionTimer, SessionTrigger, Uri,
};
use crate::transport::Connection;
use crate::{Result, SipError};
use bytes::Bytes;
use chrono::Local;
use serde::Serialize;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// 请求 / 响应邮箱容量，满时反压传输层
pub const MAILBOX_CAPACITY: usize = 1;

const COMMAND_CAPACITY: usize = 8;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// 发往会话的控制命令
pub enum SessionCommand {
    Invite {
        channel_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    QueryCatalog {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// 会话对外可见的状态
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub device_id: String,
    pub state: SessionState,
    pub transport: String,
    pub peer: String,
    pub registered_at: Option<String>,
    pub last_keepalive: Option<String>,
    pub channels: Vec<ChannelSnapshot>,
}

/// 会话邮箱的发送端
#[derive(Clone)]
pub struct SessionHandle {
    device_id: Arc<str>,
    instance: u64,
    request_tx: mpsc::Sender<Request>,
    response_tx: mpsc::Sender<Response>,
    command_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// 会话实例序号，区分同一设备先后创建的会话
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// 会话任务已退出
    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    fn closed(&self) -> SipError {
        SipError::SessionClosed(self.device_id.to_string())
    }

    pub async fn send_request(&self, req: Request) -> Result<()> {
        self.request_tx.send(req).await.map_err(|_| self.closed())
    }

    pub async fn send_response(&self, resp: Response) -> Result<()> {
        self.response_tx.send(resp).await.map_err(|_| self.closed())
    }

    pub async fn invite(&self, channel_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Invite {
            channel_id: channel_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn query_catalog(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::QueryCatalog { reply }).await?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    async fn command(&self, cmd: SessionCommand) -> Result<()> {
        self.command_tx.send(cmd).await.map_err(|_| self.closed())
    }

    /// 不带会话任务的句柄，返回的接收端存活期间句柄视为未关闭
    #[cfg(test)]
    pub(crate) fn detached(device_id: &str, instance: u64) -> (SessionHandle, mpsc::Receiver<Request>) {
        let (request_tx, request_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (response_tx, _) = mpsc::channel(MAILBOX_CAPACITY);
        let (command_tx, _) = mpsc::channel(COMMAND_CAPACITY);
        let handle = SessionHandle {
            device_id: Arc::from(device_id),
            instance,
            request_tx,
            response_tx,
            command_tx,
        };
        (handle, request_rx)
    }
}

/// 会话退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Unregistered,
    RegistrationExpired,
    KeepaliveLost,
    Cancelled,
    MailboxClosed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExitReason::Unregistered => "unregistered",
            ExitReason::RegistrationExpired => "registration expired",
            ExitReason::KeepaliveLost => "keepalive lost",
            ExitReason::Cancelled => "cancelled",
            ExitReason::MailboxClosed => "mailbox closed",
        };
        f.write_str(text)
    }
}

enum SessionEvent {
    Request(Request),
    Response(Response),
    Command(SessionCommand),
    RegisterExpired,
    KeepaliveExpired,
    CatalogDue,
    Cancelled,
    MailboxClosed,
}

/// 创建会话所需的共享上下文
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<SipServerConfig>,
    /// 平台自身的 SIP URI（sip:server_id@local_ip:port）
    pub local_uri: Uri,
    pub registry: SessionRegistry,
}

pub struct SipSession {
    device_id: String,
    instance: u64,
    config: Arc<SipServerConfig>,
    local_uri: Uri,
    registry: SessionRegistry,
    conn: Arc<dyn Connection>,
    cancel: CancellationToken,

    state: SessionState,
    transport: String,
    /// 对端真实地址（received / rport 修正后），出站请求的目的地
    source: String,
    /// Via 中的对端主机与端口，用于构造请求 URI
    peer_host: String,
    peer_port: u16,
    channels: Vec<SipChannel>,
    register_request: Option<Request>,
    catalog_sn: u32,
    registered_at: Option<String>,
    last_keepalive: Option<String>,

    request_rx: mpsc::Receiver<Request>,
    response_rx: mpsc::Receiver<Response>,
    command_rx: mpsc::Receiver<SessionCommand>,

    register_timer: SessionTimer,
    keepalive_timer: SessionTimer,
    catalog_timer: SessionTimer,
}

impl SipSession {
    /// 以设备的第一个请求创建会话，返回会话本体和邮箱句柄
    pub fn new(
        device_id: &str,
        instance: u64,
        ctx: SessionContext,
        conn: Arc<dyn Connection>,
        first: &Request,
        cancel: CancellationToken,
    ) -> (SipSession, SessionHandle) {
        let (request_tx, request_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (response_tx, response_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let handle = SessionHandle {
            device_id: Arc::from(device_id),
            instance,
            request_tx,
            response_tx,
            command_tx,
        };

        let config = ctx.config;
        let mut session = SipSession {
            device_id: device_id.to_string(),
            instance,
            register_timer: SessionTimer::new(config.register_timeout(), 0),
            keepalive_timer: SessionTimer::new(
                config.keepalive_interval(),
                config.keepalive_max_timeouts,
            ),
            catalog_timer: SessionTimer::stopped(config.catalog_interval(), 0),
            config,
            local_uri: ctx.local_uri,
            registry: ctx.registry,
            conn,
            cancel,
            state: SessionState::Init,
            transport: String::new(),
            source: String::new(),
            peer_host: String::new(),
            peer_port: 0,
            channels: Vec::new(),
            register_request: None,
            catalog_sn: 0,
            registered_at: None,
            last_keepalive: None,
            request_rx,
            response_rx,
            command_rx,
        };
        session.refresh_peer(first);

        (session, handle)
    }

    /// 运行事件循环直到会话结束
    pub async fn run(mut self) {
        let span = tracing::info_span!(
            "gb28181.session",
            device_id = %self.device_id,
            instance = self.instance
        );

        async move {
            tracing::info!(
                target: "gb28181::session",
                source = %self.source,
                transport = %self.transport,
                "Session started"
            );

            let reason = loop {
                let event = self.next_event().await;
                if let ControlFlow::Break(reason) = self.handle_event(event).await {
                    break reason;
                }

                if self.config.pull_immediately {
                    self.pull_pending_channels().await;
                }
            };

            self.finish(reason).await;
        }
        .instrument(span)
        .await
    }

    async fn next_event(&mut self) -> SessionEvent {
        tokio::select! {
            _ = self.cancel.cancelled() => SessionEvent::Cancelled,
            _ = self.register_timer.expired() => SessionEvent::RegisterExpired,
            _ = self.keepalive_timer.expired() => SessionEvent::KeepaliveExpired,
            _ = self.catalog_timer.expired() => SessionEvent::CatalogDue,
            req = self.request_rx.recv() => match req {
                Some(req) => SessionEvent::Request(req),
                None => SessionEvent::MailboxClosed,
            },
            resp = self.response_rx.recv() => match resp {
                Some(resp) => SessionEvent::Response(resp),
                None => SessionEvent::MailboxClosed,
            },
            cmd = self.command_rx.recv() => match cmd {
                Some(cmd) => SessionEvent::Command(cmd),
                None => SessionEvent::MailboxClosed,
            },
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) -> ControlFlow<ExitReason> {
        match event {
            SessionEvent::Request(req) => {
                let span = tracing::info_span!(
                    "gb28181.sip.request",
                    method = %req.method,
                    call_id = req.call_id().unwrap_or_default()
                );
                self.on_request(req).instrument(span).await
            }
            SessionEvent::Response(resp) => {
                let span = tracing::info_span!(
                    "gb28181.sip.response",
                    status = resp.status_code,
                    call_id = resp.call_id().unwrap_or_default()
                );
                self.on_response(resp).instrument(span).await;
                ControlFlow::Continue(())
            }
            SessionEvent::Command(cmd) => {
                self.on_command(cmd).await;
                ControlFlow::Continue(())
            }
            SessionEvent::RegisterExpired => {
                if self.register_timer.on_timeout() {
                    tracing::warn!(target: "gb28181::session", "Registration expired");
                    self.state = self.state.on(SessionTrigger::Timeout);
                    return ControlFlow::Break(ExitReason::RegistrationExpired);
                }
                self.register_timer.rearm();
                ControlFlow::Continue(())
            }
            SessionEvent::KeepaliveExpired => {
                if self.keepalive_timer.on_timeout() {
                    tracing::warn!(
                        target: "gb28181::session",
                        missed = self.keepalive_timer.timeout_cnt(),
                        "Keepalive lost"
                    );
                    self.state = self.state.on(SessionTrigger::Timeout);
                    return ControlFlow::Break(ExitReason::KeepaliveLost);
                }

                tracing::debug!(
                    target: "gb28181::session",
                    missed = self.keepalive_timer.timeout_cnt(),
                    max = self.keepalive_timer.max_timeout_cnt(),
                    "Keepalive missed"
                );
                self.keepalive_timer.rearm();
                ControlFlow::Continue(())
            }
            SessionEvent::CatalogDue => {
                if let Err(e) = self.send_catalog_query().await {
                    tracing::warn!(target: "gb28181::session", error = %e, "Failed to send catalog query");
                }
                self.catalog_timer.reset(self.config.catalog_interval());
                ControlFlow::Continue(())
            }
            SessionEvent::Cancelled => ControlFlow::Break(ExitReason::Cancelled),
            SessionEvent::MailboxClosed => ControlFlow::Break(ExitReason::MailboxClosed),
        }
    }

    async fn on_request(&mut self, req: Request) -> ControlFlow<ExitReason> {
        match req.method {
            Method::Register => return self.on_register(req).await,
            Method::Message => self.on_message(req).await,
            Method::Bye => self.on_bye(req).await,
            other => {
                tracing::debug!(target: "gb28181::session", method = %other, "Ignoring request");
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_register(&mut self, req: Request) -> ControlFlow<ExitReason> {
        let expires = match req.headers.get("Expires") {
            None => {
                tracing::warn!(target: "gb28181::session", "REGISTER without Expires, dropping");
                return ControlFlow::Continue(());
            }
            Some(Header::Expires(expires)) => *expires,
            Some(other) => {
                tracing::warn!(
                    target: "gb28181::session",
                    value = %other.value(),
                    default = self.config.default_register_expires,
                    "Invalid Expires in REGISTER, using default"
                );
                self.config.default_register_expires
            }
        };

        self.refresh_peer(&req);

        let now = Local::now().format(DATE_FORMAT).to_string();
        let mut resp = new_response_from_request(&req, 200, "OK", None);
        resp.headers.push(Header::Expires(expires));
        resp.headers.push(Header::other("Date", now.clone()));
        self.send(resp.into()).await;

        self.register_request = Some(req);

        if expires == 0 {
            self.state = self.state.on(SessionTrigger::Unregister);
            tracing::info!(target: "gb28181::session", "Device unregistered");
            return ControlFlow::Break(ExitReason::Unregistered);
        }

        self.register_timer.reset(Duration::from_secs(u64::from(expires)));
        self.state = self.state.on(SessionTrigger::Register);
        self.registered_at = Some(now);

        tracing::info!(
            target: "gb28181::session",
            expires,
            state = ?self.state,
            source = %self.source,
            "Device registered"
        );

        if self.channels.is_empty() {
            self.catalog_timer.fire_now();
        }

        ControlFlow::Continue(())
    }

    async fn on_message(&mut self, req: Request) {
        let Some(body) = req.body.as_ref() else {
            tracing::warn!(target: "gb28181::session", "MESSAGE without body, dropping");
            return;
        };

        let msg = match ManscdpMessage::from_body(body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(target: "gb28181::session", error = %e, "Undecodable MESSAGE body, dropping");
                return;
            }
        };

        self.reply(&req, 200, "OK").await;

        if msg.is_keepalive() {
            self.state = self.state.on(SessionTrigger::Keepalive);
            self.keepalive_timer.reset(self.config.keepalive_interval());
            self.last_keepalive = Some(Local::now().format(DATE_FORMAT).to_string());

            tracing::debug!(
                target: "gb28181::session",
                sn = ?msg.sn,
                status = ?msg.status,
                state = ?self.state,
                "Keepalive"
            );
        } else if msg.is_catalog() {
            let added = merge_channels(&mut self.channels, msg.items());

            tracing::info!(
                target: "gb28181::session",
                sn = ?msg.sn,
                sum_num = ?msg.sum_num,
                items = msg.items().len(),
                added,
                total = self.channels.len(),
                "Catalog received"
            );
        } else {
            tracing::info!(target: "gb28181::session", cmd_type = %msg.cmd_type, "Unhandled MANSCDP command");
        }
    }

    async fn on_bye(&mut self, req: Request) {
        self.reply(&req, 200, "OK").await;

        let Some(call_id) = req.call_id() else {
            return;
        };

        match self.channels.iter_mut().find(|c| c.matches_call(call_id)) {
            Some(channel) => {
                channel.play = channel.play.on(InviteTrigger::Done);
                tracing::info!(
                    target: "gb28181::session",
                    channel_id = %channel.channel_id,
                    state = ?channel.play,
                    "Stream closed by device"
                );
            }
            None => {
                tracing::debug!(target: "gb28181::session", "BYE for unknown dialog");
            }
        }
    }

    async fn on_response(&mut self, resp: Response) {
        let Some((_, method)) = resp.headers.cseq() else {
            tracing::warn!(target: "gb28181::session", "Response without CSeq, dropping");
            return;
        };

        if method != Method::Invite {
            tracing::debug!(
                target: "gb28181::session",
                method = %method,
                status = resp.status_code,
                "Response received"
            );
            return;
        }

        let call_id = resp.call_id().unwrap_or_default();
        let Some(idx) = self.channels.iter().position(|c| c.matches_call(call_id)) else {
            tracing::warn!(target: "gb28181::session", "INVITE response for unknown dialog");
            return;
        };

        let ack = {
            let channel = &mut self.channels[idx];

            if resp.is_provisional() {
                channel.play = channel.play.on(InviteTrigger::Trying);
                return;
            }

            let Some(invite) = channel.invite_request.as_ref() else {
                return;
            };
            let ack = new_ack_request(invite, &resp, None);

            if resp.is_success() {
                channel.play = channel.play.on(InviteTrigger::Ok);
                match resp.body.as_ref().map(|b| SdpSession::from_string(&String::from_utf8_lossy(b))) {
                    Some(Ok(answer)) => tracing::info!(
                        target: "gb28181::session",
                        channel_id = %channel.channel_id,
                        media_addr = %answer.address,
                        media_port = answer.media_port,
                        ssrc = ?answer.ssrc,
                        "Stream established"
                    ),
                    Some(Err(e)) => tracing::warn!(
                        target: "gb28181::session",
                        channel_id = %channel.channel_id,
                        error = %e,
                        "Stream established with unreadable SDP answer"
                    ),
                    None => tracing::info!(
                        target: "gb28181::session",
                        channel_id = %channel.channel_id,
                        "Stream established"
                    ),
                }
                channel.invite_response = Some(resp);
            } else {
                channel.play = channel.play.on(InviteTrigger::Rejected);
                tracing::warn!(
                    target: "gb28181::session",
                    channel_id = %channel.channel_id,
                    status = resp.status_code,
                    reason = %resp.reason,
                    "INVITE rejected"
                );
            }

            ack
        };

        self.send(ack.into()).await;
    }

    async fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Invite { channel_id, reply } => {
                let result = self.invite_channel(&channel_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::QueryCatalog { reply } => {
                let result = match self.ensure_registered() {
                    Ok(()) => self.send_catalog_query().await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn ensure_registered(&self) -> Result<()> {
        match self.state {
            SessionState::Register | SessionState::Alive => Ok(()),
            state => Err(SipError::InvalidState(format!(
                "device {} is not registered ({:?})",
                self.device_id, state
            ))),
        }
    }

    async fn invite_channel(&mut self, channel_id: &str) -> Result<()> {
        self.ensure_registered()?;

        let idx = self
            .channels
            .iter()
            .position(|c| c.channel_id == channel_id)
            .ok_or_else(|| SipError::ChannelNotFound(channel_id.to_string()))?;

        let state = self.channels[idx].play;
        if state.on(InviteTrigger::Invite) == state {
            return Err(SipError::InvalidState(format!(
                "channel {} invite state is {:?}",
                channel_id, state
            )));
        }

        self.send_invite(idx).await
    }

    /// 对 Init 状态的通道立即发起点播
    async fn pull_pending_channels(&mut self) {
        if self.ensure_registered().is_err() {
            return;
        }

        let pending: Vec<usize> = self
            .channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.play == InviteState::Init)
            .map(|(i, _)| i)
            .collect();

        for idx in pending {
            if let Err(e) = self.send_invite(idx).await {
                tracing::warn!(
                    target: "gb28181::session",
                    channel_id = %self.channels[idx].channel_id,
                    error = %e,
                    "Failed to pull channel"
                );
            }
        }
    }

    async fn send_invite(&mut self, idx: usize) -> Result<()> {
        let channel_id = self.channels[idx].channel_id.clone();
        let ssrc = generate_ssrc(&self.config.realm, true);

        let sdp = SdpSession::new(
            SessionKind::Play,
            self.config.server_id.clone(),
            self.local_uri.host.clone(),
            self.config.media_port,
        )
        .with_ssrc(ssrc.clone());

        // 响应按 To 用户路由回会话，所以请求 URI 指向设备，通道由 Subject 指定
        let recipient = Uri::sip(self.device_id.clone(), self.peer_host.clone(), Some(self.peer_port));
        let mut req = new_invite_request(
            &self.local_uri,
            &recipient,
            &self.transport,
            Some(Bytes::from(sdp.to_string())),
        );

        req.headers.push(Header::other(
            "Subject",
            format!("{}:{},{}:0", channel_id, ssrc, self.config.server_id),
        ));
        // Content-Length 保持在最后
        let body = req.body.take();
        req.set_body(body);
        req.set_transport(self.transport.clone());
        req.set_destination(self.source.clone());

        self.conn.write_msg(&Message::Request(req.clone())).await?;

        let channel = &mut self.channels[idx];
        channel.play = channel.play.on(InviteTrigger::Invite);
        channel.invite_request = Some(req);
        channel.invite_response = None;

        tracing::info!(target: "gb28181::session", channel_id = %channel_id, %ssrc, "INVITE sent");
        Ok(())
    }

    async fn send_catalog_query(&mut self) -> Result<()> {
        self.catalog_sn = self.catalog_sn.wrapping_add(1);
        let body = CatalogQuery::new(self.catalog_sn, self.device_id.clone()).to_xml();

        let recipient = Uri::sip(self.device_id.clone(), self.peer_host.clone(), Some(self.peer_port));
        let mut req = new_catalog_request(
            &self.local_uri,
            &recipient,
            &self.transport,
            Some(Bytes::from(body)),
        );
        req.set_transport(self.transport.clone());
        req.set_destination(self.source.clone());

        self.conn.write_msg(&Message::Request(req)).await?;

        tracing::debug!(target: "gb28181::session", sn = self.catalog_sn, "Catalog query sent");
        Ok(())
    }

    /// 用请求刷新对端地址
    fn refresh_peer(&mut self, req: &Request) {
        self.transport = req.transport();
        self.source = req.source();

        if let Some(via) = req.headers.via() {
            self.peer_host = via.host.clone();
            self.peer_port = via.port.unwrap_or_else(|| default_port(&self.transport));
        }
    }

    async fn reply(&self, req: &Request, status: u16, reason: &str) {
        let resp = new_response_from_request(req, status, reason, None);
        self.send(resp.into()).await;
    }

    async fn send(&self, msg: Message) {
        if let Err(e) = self.conn.write_msg(&msg).await {
            tracing::warn!(
                target: "gb28181::session",
                message = %msg.short(),
                error = %e,
                "Failed to send SIP message"
            );
        }
    }

    /// 关闭邮箱前已入队的消息不再处理
    fn discard_queued(&mut self) {
        while let Ok(req) = self.request_rx.try_recv() {
            tracing::debug!(target: "gb28181::session", method = %req.method, "Discarding request queued before close");
        }
        while let Ok(resp) = self.response_rx.try_recv() {
            tracing::debug!(target: "gb28181::session", status = resp.status_code, "Discarding response queued before close");
        }
        // 丢弃命令即关闭其 oneshot，调用方得到 SessionClosed
        while self.command_rx.try_recv().is_ok() {}
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device_id: self.device_id.clone(),
            state: self.state,
            transport: self.transport.clone(),
            peer: self.source.clone(),
            registered_at: self.registered_at.clone(),
            last_keepalive: self.last_keepalive.clone(),
            channels: self.channels.iter().map(|c| c.snapshot()).collect(),
        }
    }

    /// 退出：取消未完成的 INVITE，停止定时器，释放连接，移除注册表项
    async fn finish(&mut self, reason: ExitReason) {
        // 先关闭邮箱，注册表随即把句柄视为已关闭，新请求会创建新会话
        self.request_rx.close();
        self.response_rx.close();
        self.command_rx.close();
        self.discard_queued();

        let cancels: Vec<Request> = self
            .channels
            .iter()
            .filter(|c| c.play.is_pending())
            .filter_map(|c| c.invite_request.as_ref().map(new_cancel_request))
            .collect();

        for cancel in cancels {
            self.send(cancel.into()).await;
        }

        self.state = self.state.on(SessionTrigger::Timeout);
        self.register_timer.stop();
        self.keepalive_timer.stop();
        self.catalog_timer.stop();

        match self.conn.try_close().await {
            Ok(remaining) => {
                tracing::debug!(target: "gb28181::session", remaining, "Connection reference released");
            }
            Err(e) => {
                tracing::warn!(target: "gb28181::session", error = %e, "Failed to release connection");
            }
        }

        self.registry.remove(&self.device_id, self.instance).await;

        tracing::info!(target: "gb28181::session", %reason, "Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicI32, Ordering};
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout, Instant};

    const DEVICE: &str = "34020000001320000001";
    const CHANNEL: &str = "34020000001310000001";
    const PEER: &str = "192.168.1.64:5060";

    struct MockConnection {
        sent: mpsc::UnboundedSender<Message>,
        closed: AtomicI32,
        /// 设置时 try_close 等到放行才返回
        close_gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn write_msg(&self, msg: &Message) -> Result<()> {
            let _ = self.sent.send(msg.clone());
            Ok(())
        }

        fn reference(&self, _delta: i32) {}

        async fn try_close(&self) -> Result<i32> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.close_gate {
                gate.notified().await;
            }
            Ok(0)
        }

        fn remote_addr(&self) -> SocketAddr {
            PEER.parse().unwrap()
        }

        fn transport(&self) -> &'static str {
            "UDP"
        }
    }

    struct Harness {
        handle: SessionHandle,
        sent: mpsc::UnboundedReceiver<Message>,
        conn: Arc<MockConnection>,
        registry: SessionRegistry,
        task: JoinHandle<()>,
    }

    impl Harness {
        async fn next(&mut self) -> Message {
            timeout(Duration::from_secs(5), self.sent.recv())
                .await
                .expect("timed out waiting for message")
                .expect("connection dropped")
        }

        async fn next_request(&mut self) -> Request {
            match self.next().await {
                Message::Request(req) => req,
                other => panic!("expected request, got {}", other.short()),
            }
        }

        async fn next_response(&mut self) -> Response {
            match self.next().await {
                Message::Response(resp) => resp,
                other => panic!("expected response, got {}", other.short()),
            }
        }

        /// 上报目录并发起点播，返回发出的 INVITE
        async fn invite_channel(&mut self) -> Request {
            self.handle.send_request(catalog(1)).await.unwrap();
            assert_eq!(self.next_response().await.status_code, 200);

            self.handle.invite(CHANNEL).await.unwrap();
            let invite = self.next_request().await;
            assert_eq!(invite.method, Method::Invite);
            invite
        }

        /// 注册并吃掉 200 和自动目录查询
        async fn register(&mut self) {
            self.handle.send_request(register(3600)).await.unwrap();
            assert_eq!(self.next_response().await.status_code, 200);
            assert_eq!(self.next_request().await.method, Method::Message);
        }
    }

    async fn start(config: SipServerConfig) -> Harness {
        start_with(config, None).await
    }

    async fn start_with(config: SipServerConfig, close_gate: Option<Arc<Notify>>) -> Harness {
        let (tx, sent) = mpsc::unbounded_channel();
        let conn = Arc::new(MockConnection {
            sent: tx,
            closed: AtomicI32::new(0),
            close_gate,
        });
        let registry = SessionRegistry::new();
        let ctx = SessionContext {
            config: Arc::new(config),
            local_uri: Uri::sip("34020000002000000001", "192.168.1.10", Some(5060)),
            registry: registry.clone(),
        };

        let first = register(3600);
        let (session, handle) = SipSession::new(
            DEVICE,
            1,
            ctx,
            conn.clone(),
            &first,
            CancellationToken::new(),
        );

        let registered = handle.clone();
        registry
            .get_or_create(DEVICE, || async move { Ok(registered) })
            .await
            .unwrap();

        Harness {
            handle,
            sent,
            conn,
            registry,
            task: tokio::spawn(session.run()),
        }
    }

    fn request(text: String) -> Request {
        match Message::decode(text.as_bytes()).unwrap() {
            Message::Request(mut req) => {
                req.set_source(PEER);
                req.set_transport("UDP");
                req
            }
            Message::Response(_) => panic!("expected request"),
        }
    }

    fn register(expires: u32) -> Request {
        request(format!(
            "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK1001\r\n\
From: <sip:{DEVICE}@3402000000>;tag=1001\r\n\
To: <sip:{DEVICE}@3402000000>\r\n\
Call-ID: reg-1@192.168.1.64\r\n\
CSeq: 1 REGISTER\r\n\
Max-Forwards: 70\r\n\
Expires: {expires}\r\n\
Content-Length: 0\r\n\r\n"
        ))
    }

    fn message(sn: u32, xml: &str) -> Request {
        request(format!(
            "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK2{sn:03}\r\n\
From: <sip:{DEVICE}@3402000000>;tag=2001\r\n\
To: <sip:34020000002000000001@3402000000>\r\n\
Call-ID: msg-{sn}@192.168.1.64\r\n\
CSeq: {sn} MESSAGE\r\n\
Max-Forwards: 70\r\n\
Content-Type: Application/MANSCDP+xml\r\n\
Content-Length: {}\r\n\r\n{xml}",
            xml.len()
        ))
    }

    fn keepalive(sn: u32) -> Request {
        message(
            sn,
            &format!(
                "<?xml version=\"1.0\"?>\r\n<Notify>\r\n<CmdType>Keepalive</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{DEVICE}</DeviceID>\r\n<Status>OK</Status>\r\n</Notify>\r\n"
            ),
        )
    }

    fn catalog(sn: u32) -> Request {
        message(
            sn,
            &format!(
                "<?xml version=\"1.0\"?>\r\n<Response>\r\n<CmdType>Catalog</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{DEVICE}</DeviceID>\r\n<SumNum>1</SumNum>\r\n<DeviceList Num=\"1\">\r\n<Item>\r\n<DeviceID>{CHANNEL}</DeviceID>\r\n<Name>Camera 1</Name>\r\n<Status>ON</Status>\r\n</Item>\r\n</DeviceList>\r\n</Response>\r\n"
            ),
        )
    }

    #[tokio::test]
    async fn test_register_replies_and_queries_catalog() {
        let mut h = start(SipServerConfig::default()).await;

        h.handle.send_request(register(3600)).await.unwrap();

        let ok = h.next_response().await;
        assert_eq!(ok.status_code, 200);
        assert_eq!(ok.headers.get("Expires"), Some(&Header::Expires(3600)));
        assert!(ok.headers.get("Date").is_some());
        assert_eq!(ok.destination(), PEER);

        let query = h.next_request().await;
        assert_eq!(query.method, Method::Message);
        assert_eq!(query.destination(), PEER);
        let body = String::from_utf8(query.body.unwrap().to_vec()).unwrap();
        assert!(body.contains("<CmdType>Catalog</CmdType>"));
        assert!(body.contains(&format!("<DeviceID>{}</DeviceID>", DEVICE)));

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Register);
        assert_eq!(snapshot.peer, PEER);
        assert!(snapshot.registered_at.is_some());
    }

    #[tokio::test]
    async fn test_keepalive_moves_session_alive() {
        let mut h = start(SipServerConfig::default()).await;
        h.register().await;

        h.handle.send_request(keepalive(7)).await.unwrap();
        assert_eq!(h.next_response().await.status_code, 200);

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Alive);
        assert!(snapshot.last_keepalive.is_some());
    }

    #[tokio::test]
    async fn test_invite_requires_registration_and_known_channel() {
        let mut h = start(SipServerConfig::default()).await;

        let err = h.handle.invite(CHANNEL).await.unwrap_err();
        assert!(matches!(err, SipError::InvalidState(_)));

        h.register().await;

        let err = h.handle.invite(CHANNEL).await.unwrap_err();
        assert!(matches!(err, SipError::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn test_invite_ok_sends_ack() {
        let mut h = start(SipServerConfig::default()).await;
        h.register().await;

        h.handle.send_request(catalog(1)).await.unwrap();
        assert_eq!(h.next_response().await.status_code, 200);

        h.handle.invite(CHANNEL).await.unwrap();

        let invite = h.next_request().await;
        assert_eq!(invite.method, Method::Invite);
        assert_eq!(invite.recipient.user(), Some(DEVICE));
        assert_eq!(invite.recipient.host, "192.168.1.64");
        assert_eq!(invite.destination(), PEER);
        let subject = invite.headers.get("Subject").unwrap().value();
        assert!(subject.starts_with(&format!("{}:0", CHANNEL)));
        assert!(subject.ends_with(",34020000002000000001:0"));
        let sdp = String::from_utf8(invite.body.clone().unwrap().to_vec()).unwrap();
        assert!(sdp.contains("s=Play\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.10\r\n"));
        assert!(matches!(
            invite.headers.iter().last(),
            Some(Header::ContentLength(_))
        ));

        // 第二次点播在完成前被拒绝
        let err = h.handle.invite(CHANNEL).await.unwrap_err();
        assert!(matches!(err, SipError::InvalidState(_)));

        let mut ok = new_response_from_request(&invite, 200, "OK", None);
        ok.set_body(Some(Bytes::from_static(
            b"v=0\r\no=34020000001320000001 0 0 IN IP4 192.168.1.64\r\ns=Play\r\nc=IN IP4 192.168.1.64\r\nt=0 0\r\nm=video 15060 RTP/AVP 96\r\na=sendonly\r\na=rtpmap:96 PS/90000\r\ny=0200001234\r\n",
        )));
        ok.set_source(PEER);
        h.handle.send_response(ok).await.unwrap();

        let ack = h.next_request().await;
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.call_id(), invite.call_id());

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.channels.len(), 1);
        assert_eq!(snapshot.channels[0].play, InviteState::Ok);
    }

    #[tokio::test]
    async fn test_unregister_closes_session() {
        let mut h = start(SipServerConfig::default()).await;
        h.register().await;

        h.handle.send_request(register(0)).await.unwrap();
        assert_eq!(h.next_response().await.status_code, 200);

        timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap();
        assert!(h.registry.is_empty().await);
        assert_eq!(h.conn.closed.load(Ordering::SeqCst), 1);
        assert!(h.handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_keepalives_close_session() {
        let config = SipServerConfig {
            keepalive_interval_secs: 1,
            keepalive_max_timeouts: 1,
            ..Default::default()
        };
        let mut h = start(config).await;
        h.register().await;

        timeout(Duration::from_secs(30), h.task).await.unwrap().unwrap();
        assert!(h.registry.is_empty().await);
        assert_eq!(h.conn.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_expires_after_granted_period() {
        let config = SipServerConfig {
            keepalive_interval_secs: 3600,
            ..Default::default()
        };
        let mut h = start(config).await;

        h.handle.send_request(register(60)).await.unwrap();
        let ok = h.next_response().await;
        assert_eq!(ok.headers.get("Expires"), Some(&Header::Expires(60)));
        assert_eq!(h.next_request().await.method, Method::Message);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!h.task.is_finished());

        timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap();
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_message_without_body_is_dropped() {
        let mut h = start(SipServerConfig::default()).await;
        h.register().await;

        let mut req = keepalive(3);
        req.set_body(None);
        h.handle.send_request(req).await.unwrap();

        h.handle.send_request(keepalive(4)).await.unwrap();
        let resp = h.next_response().await;
        assert_eq!(resp.headers.cseq(), Some((4, Method::Message)));
    }

    #[tokio::test]
    async fn test_pull_immediately_invites_after_catalog() {
        let config = SipServerConfig {
            pull_immediately: true,
            ..Default::default()
        };
        let mut h = start(config).await;
        h.register().await;

        h.handle.send_request(catalog(1)).await.unwrap();
        assert_eq!(h.next_response().await.status_code, 200);

        let invite = h.next_request().await;
        assert_eq!(invite.method, Method::Invite);
        let subject = invite.headers.get("Subject").unwrap().value();
        assert!(subject.starts_with(CHANNEL));

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.channels[0].play, InviteState::Start);
    }

    #[tokio::test]
    async fn test_rejected_invite_is_acked_and_can_be_retried() {
        let mut h = start(SipServerConfig::default()).await;
        h.register().await;
        let invite = h.invite_channel().await;

        let trying = new_response_from_request(&invite, 100, "Trying", None);
        h.handle.send_response(trying).await.unwrap();
        let busy = new_response_from_request(&invite, 486, "Busy Here", None);
        h.handle.send_response(busy).await.unwrap();

        // 非 2xx 的 ACK 与 INVITE 同属一个事务，沿用其 branch
        let ack = h.next_request().await;
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.call_id(), invite.call_id());
        assert_eq!(
            ack.headers.via().and_then(|v| v.branch()),
            invite.headers.via().and_then(|v| v.branch())
        );
        let invite_seq = invite.headers.cseq().map(|(seq, _)| seq).unwrap();
        assert_eq!(ack.headers.cseq(), Some((invite_seq, Method::Ack)));

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.channels[0].play, InviteState::Done);

        // Done 状态可以再次点播
        h.handle.invite(CHANNEL).await.unwrap();
        let retry = h.next_request().await;
        assert_eq!(retry.method, Method::Invite);

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.channels[0].play, InviteState::Start);
    }

    #[tokio::test]
    async fn test_pending_invite_is_cancelled_on_exit() {
        let mut h = start(SipServerConfig::default()).await;
        h.register().await;
        let invite = h.invite_channel().await;

        h.handle.send_request(register(0)).await.unwrap();
        assert_eq!(h.next_response().await.status_code, 200);

        let cancel = h.next_request().await;
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.call_id(), invite.call_id());
        let invite_seq = invite.headers.cseq().map(|(seq, _)| seq).unwrap();
        assert_eq!(cancel.headers.cseq(), Some((invite_seq, Method::Cancel)));
        assert_eq!(
            cancel.headers.via().and_then(|v| v.branch()),
            invite.headers.via().and_then(|v| v.branch())
        );

        timeout(Duration::from_secs(5), &mut h.task).await.unwrap().unwrap();
        assert!(h.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_requests_during_teardown_see_closed_session() {
        let gate = Arc::new(Notify::new());
        let mut h = start_with(SipServerConfig::default(), Some(gate.clone())).await;
        h.register().await;

        h.handle.send_request(register(0)).await.unwrap();
        assert_eq!(h.next_response().await.status_code, 200);

        // 会话停在 try_close 上
        while h.conn.closed.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!h.task.is_finished());

        assert!(h.handle.is_closed());
        assert!(h.registry.get(DEVICE).await.is_none());
        assert!(matches!(
            h.handle.send_request(register(3600)).await,
            Err(SipError::SessionClosed(_))
        ));

        let (next, _next_rx) = SessionHandle::detached(DEVICE, 2);
        let replaced = h
            .registry
            .get_or_create(DEVICE, || async move { Ok(next) })
            .await
            .unwrap();
        assert_eq!(replaced.instance(), 2);

        gate.notify_one();
        timeout(Duration::from_secs(5), &mut h.task).await.unwrap().unwrap();

        // 旧会话退出不影响新会话的注册表项
        assert_eq!(h.registry.get(DEVICE).await.map(|s| s.instance()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_clears_missed_count() {
        let config = SipServerConfig {
            keepalive_interval_secs: 10,
            keepalive_max_timeouts: 1,
            ..Default::default()
        };
        let begin = Instant::now();
        let mut h = start(config).await;
        h.register().await;

        // 10s 处丢失一次
        sleep(Duration::from_secs(15)).await;
        h.handle.send_request(keepalive(1)).await.unwrap();
        assert_eq!(h.next_response().await.status_code, 200);

        // 计数已清零：25s 处再丢一次仍存活，35s 处才耗尽
        sleep(Duration::from_secs(18)).await;
        assert!(!h.task.is_finished());

        timeout(Duration::from_secs(10), &mut h.task).await.unwrap().unwrap();
        assert!(begin.elapsed() >= Duration::from_secs(35));
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_query_repeats_every_interval() {
        let config = SipServerConfig {
            catalog_interval_secs: 30,
            ..Default::default()
        };
        let mut h = start(config).await;
        h.register().await;
        let begin = Instant::now();

        let next = timeout(Duration::from_secs(60), h.sent.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Request(query) = next else {
            panic!("expected catalog query");
        };
        assert_eq!(query.method, Method::Message);
        let body = String::from_utf8(query.body.unwrap().to_vec()).unwrap();
        assert!(body.contains("<CmdType>Catalog</CmdType>"));
        assert!(body.contains("<SN>2</SN>"));

        let waited = begin.elapsed();
        assert!(waited >= Duration::from_secs(29) && waited <= Duration::from_secs(31), "{:?}", waited);
    }
}
