// 会话定时器
// 注册过期、心跳保活、目录刷新共用同一结构

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

/// 超出 Instant 表示范围时的到期时间，约三十年
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// 可重置的会话定时器
///
/// `reset` 会清零超时计数；`rearm` 只重新计时，保留计数。
/// 停止后的定时器在 `expired` 上永远挂起，便于放进 `select!`。
#[derive(Debug)]
pub struct SessionTimer {
    sleep: Pin<Box<Sleep>>,
    duration: Duration,
    timeout_cnt: u32,
    max_timeout_cnt: u32,
    active: bool,
}

impl SessionTimer {
    /// 创建并立即开始计时
    pub fn new(duration: Duration, max_timeout_cnt: u32) -> Self {
        Self {
            sleep: Box::pin(sleep(duration.min(FAR_FUTURE))),
            duration,
            timeout_cnt: 0,
            max_timeout_cnt,
            active: true,
        }
    }

    /// 创建一个未启动的定时器
    pub fn stopped(duration: Duration, max_timeout_cnt: u32) -> Self {
        let mut timer = Self::new(duration, max_timeout_cnt);
        timer.active = false;
        timer
    }

    /// 以新的时长重新计时，并清零超时计数
    pub fn reset(&mut self, duration: Duration) {
        self.duration = duration;
        self.timeout_cnt = 0;
        self.rearm();
    }

    /// 以当前时长重新计时，保留超时计数
    pub fn rearm(&mut self) {
        self.sleep.as_mut().reset(deadline(self.duration));
        self.active = true;
    }

    /// 立即触发
    pub fn fire_now(&mut self) {
        self.sleep.as_mut().reset(Instant::now());
        self.active = true;
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    /// 等待到期；未启动时永不返回
    pub async fn expired(&mut self) {
        if !self.active {
            pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.active = false;
    }

    /// 记一次超时，返回是否已超过上限
    pub fn on_timeout(&mut self) -> bool {
        self.timeout_cnt += 1;
        self.timeout_cnt > self.max_timeout_cnt
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn timeout_cnt(&self) -> u32 {
        self.timeout_cnt
    }

    pub fn max_timeout_cnt(&self) -> u32 {
        self.max_timeout_cnt
    }
}

fn deadline(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_duration() {
        let start = Instant::now();
        let mut timer = SessionTimer::new(Duration::from_secs(60), 0);

        timer.expired().await;

        assert!(Instant::now() - start >= Duration::from_secs(60));
        assert!(!timer.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_never_fires() {
        let mut timer = SessionTimer::new(Duration::from_secs(1), 0);
        timer.stop();

        let fired = tokio::time::timeout(Duration::from_secs(3600), timer.expired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_now() {
        let start = Instant::now();
        let mut timer = SessionTimer::stopped(Duration::from_secs(600), 0);

        timer.fire_now();
        timer.expired().await;

        assert!(Instant::now() - start < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_restarts_countdown() {
        let mut timer = SessionTimer::new(Duration::from_secs(10), 0);
        tokio::time::advance(Duration::from_secs(8)).await;
        timer.rearm();

        let mut expired = tokio_test::task::spawn(timer.expired());
        tokio_test::assert_pending!(expired.poll());

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio_test::assert_pending!(expired.poll());

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio_test::assert_ready!(expired.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_duration_does_not_overflow() {
        let mut timer = SessionTimer::new(Duration::MAX, 0);
        timer.reset(Duration::MAX);
        assert!(timer.is_active());

        let fired = tokio::time::timeout(Duration::from_secs(3600), timer.expired()).await;
        assert!(fired.is_err());
    }

    #[test]
    fn test_reset_clears_count_and_rearm_keeps_it() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut timer = SessionTimer::new(Duration::from_secs(60), 3);

            assert!(!timer.on_timeout());
            assert!(!timer.on_timeout());
            timer.rearm();
            assert_eq!(timer.timeout_cnt(), 2);

            timer.reset(Duration::from_secs(30));
            assert_eq!(timer.timeout_cnt(), 0);
            assert_eq!(timer.duration(), Duration::from_secs(30));
        });
    }

    #[test]
    fn test_exhausted_after_max_plus_one() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut timer = SessionTimer::new(Duration::from_secs(1), 3);
            assert!(!timer.on_timeout());
            assert!(!timer.on_timeout());
            assert!(!timer.on_timeout());
            assert!(timer.on_timeout());

            // 注册定时器上限为 0，第一次超时即耗尽
            let mut register = SessionTimer::new(Duration::from_secs(60), 0);
            assert!(register.on_timeout());
        });
    }
}
