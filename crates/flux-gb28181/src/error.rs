use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    /// 报文 / 头部 / URI 解析失败
    #[error("Parse error in {context}: {reason} (input: {input:?})")]
    Parse {
        context: String,
        reason: String,
        input: String,
    },

    /// 缺少必需头部等协议违规
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Session not found: {0}")]
    UnknownSession(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl SipError {
    pub fn parse(
        context: impl Into<String>,
        input: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        SipError::Parse {
            context: context.into(),
            reason: reason.into(),
            input: input.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SipError>;
