// 设备通道
// 由目录应答创建，记录各类点播的状态和最近一次 INVITE

use crate::body::CatalogItem;
use crate::sip::{InviteState, Request, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct SipChannel {
    pub channel_id: String,
    pub name: String,
    /// ON / OFF
    pub status: String,

    /// 实时点播
    pub play: InviteState,
    pub playback: InviteState,
    pub download: InviteState,
    pub talk: InviteState,

    pub invite_request: Option<Request>,
    pub invite_response: Option<Response>,
}

impl SipChannel {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            name: String::new(),
            status: String::new(),
            play: InviteState::Init,
            playback: InviteState::Init,
            download: InviteState::Init,
            talk: InviteState::Init,
            invite_request: None,
            invite_response: None,
        }
    }

    pub fn from_item(item: &CatalogItem) -> Self {
        let mut channel = Self::new(item.device_id.clone());
        channel.refresh(item);
        channel
    }

    /// 用目录项刷新描述信息，不影响点播状态
    pub fn refresh(&mut self, item: &CatalogItem) {
        self.name = item.name.clone();
        self.status = item.status.clone();
    }

    /// 是否为该通道 INVITE 的对话
    pub fn matches_call(&self, call_id: &str) -> bool {
        self.invite_request
            .as_ref()
            .and_then(|req| req.call_id())
            .is_some_and(|id| id == call_id)
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            channel_id: self.channel_id.clone(),
            name: self.name.clone(),
            status: self.status.clone(),
            play: self.play,
            playback: self.playback,
            download: self.download,
            talk: self.talk,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub name: String,
    pub status: String,
    pub play: InviteState,
    pub playback: InviteState,
    pub download: InviteState,
    pub talk: InviteState,
}

/// 合并目录：新 ID 以 Init 状态追加，已有 ID 保留状态。返回新增数量
pub fn merge_channels(channels: &mut Vec<SipChannel>, items: &[CatalogItem]) -> usize {
    let mut added = 0;

    for item in items {
        match channels.iter_mut().find(|c| c.channel_id == item.device_id) {
            Some(existing) => existing.refresh(item),
            None => {
                channels.push(SipChannel::from_item(item));
                added += 1;
            }
        }
    }

    added
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, name: &str) -> CatalogItem {
        CatalogItem {
            device_id: id.to_string(),
            name: name.to_string(),
            manufacturer: String::new(),
            model: String::new(),
            status: "ON".to_string(),
            parent_id: String::new(),
        }
    }

    #[test]
    fn test_merge_appends_new_and_keeps_existing_state() {
        let mut channels = vec![SipChannel::new("34020000001320000001")];
        channels[0].play = InviteState::Ok;

        let added = merge_channels(
            &mut channels,
            &[
                item("34020000001320000001", "大门"),
                item("34020000001320000002", "后院"),
            ],
        );

        assert_eq!(added, 1);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].play, InviteState::Ok);
        assert_eq!(channels[0].name, "大门");
        assert_eq!(channels[1].channel_id, "34020000001320000002");
        assert_eq!(channels[1].play, InviteState::Init);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut channels = Vec::new();
        let items = [item("34020000001320000001", "a")];

        assert_eq!(merge_channels(&mut channels, &items), 1);
        assert_eq!(merge_channels(&mut channels, &items), 0);
        assert_eq!(channels.len(), 1);
    }

    #[test]
    fn test_matches_call_requires_invite() {
        let channel = SipChannel::new("34020000001320000001");
        assert!(!channel.matches_call("abc"));
    }
}
