// 连接抽象
// 会话通过共享句柄写消息；引用计数归零时由传输层回收

use crate::sip::Message;
use crate::Result;
use async_trait::async_trait;
use std::net::SocketAddr;

#[async_trait]
pub trait Connection: Send + Sync {
    /// 序列化消息并发送到其解析出的目的地址
    async fn write_msg(&self, msg: &Message) -> Result<()>;

    /// 增减引用计数
    fn reference(&self, delta: i32);

    /// 释放一次引用，返回剩余引用数；归零时连接被回收
    async fn try_close(&self) -> Result<i32>;

    fn remote_addr(&self) -> SocketAddr;

    fn transport(&self) -> &'static str;
}

/// 传输层收到的消息统一交给一个处理器
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: Message);
}
