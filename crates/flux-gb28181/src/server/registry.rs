// 会话注册表
// 设备 ID -> 会话句柄；创建在写锁内完成，保证同一设备只有一个活动会话

use super::session::SessionHandle;
use crate::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查找活动会话
    pub async fn get(&self, device_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions
            .get(device_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// 查找会话，不存在（或已退出）时用 `create` 创建并登记
    pub async fn get_or_create<F, Fut>(&self, device_id: &str, create: F) -> Result<SessionHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SessionHandle>>,
    {
        let mut sessions = self.sessions.write().await;

        if let Some(handle) = sessions.get(device_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let handle = create().await?;
        sessions.insert(device_id.to_string(), handle.clone());

        tracing::debug!(
            target: "gb28181::session",
            device_id,
            instance = handle.instance(),
            total = sessions.len(),
            "Session registered"
        );

        Ok(handle)
    }

    /// 移除会话；只有实例号一致时才移除，避免误删同一设备的新会话
    pub async fn remove(&self, device_id: &str, instance: u64) -> bool {
        let mut sessions = self.sessions.write().await;

        match sessions.get(device_id) {
            Some(handle) if handle.instance() == instance => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// 已登记的设备 ID（排序）
    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
