// 会话与点播状态机
// 纯函数迁移：on(trigger) 返回新状态，不合法的组合保持原状态

use serde::Serialize;

/// 设备会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Init,
    Register,
    Alive,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTrigger {
    Register,
    Keepalive,
    Unregister,
    Timeout,
}

impl SessionState {
    pub fn on(self, trigger: SessionTrigger) -> SessionState {
        use SessionState::*;

        match (self, trigger) {
            (Destroy, _) => Destroy,
            (_, SessionTrigger::Unregister) | (_, SessionTrigger::Timeout) => Destroy,
            (Init, SessionTrigger::Register) => Register,
            (Register, SessionTrigger::Keepalive) => Alive,
            (state, _) => state,
        }
    }
}

/// 通道点播状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteState {
    #[default]
    Init,
    Start,
    Trying,
    Ok,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteTrigger {
    /// 发出 INVITE
    Invite,
    /// 收到 1xx
    Trying,
    /// 收到 2xx
    Ok,
    /// 会话结束（BYE）
    Done,
    /// 收到 >= 300
    Rejected,
}

impl InviteState {
    pub fn on(self, trigger: InviteTrigger) -> InviteState {
        use InviteState::*;

        match (self, trigger) {
            (Init | Done, InviteTrigger::Invite) => Start,
            (Start, InviteTrigger::Trying) => Trying,
            (Start | Trying, InviteTrigger::Ok) => Ok,
            (Ok, InviteTrigger::Done) => Done,
            (Start | Trying, InviteTrigger::Rejected) => Done,
            (state, _) => state,
        }
    }

    /// INVITE 已发出但尚未收到最终响应
    pub fn is_pending(self) -> bool {
        matches!(self, InviteState::Start | InviteState::Trying)
    }
}
