// 关闭信号

use tokio::signal;

/// 关闭信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Term,
    /// SIGINT / Ctrl+C
    Interrupt,
}

/// 等待 SIGTERM 或 SIGINT
#[cfg(unix)]
pub async fn wait_for_shutdown() -> ShutdownSignal {
    use signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(target: "gb28181d", "Failed to install signal handlers, falling back to Ctrl+C: {}", e);
            return wait_for_ctrl_c().await;
        }
    };

    let received = tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Term,
        _ = sigint.recv() => ShutdownSignal::Interrupt,
    };

    tracing::info!(target: "gb28181d", signal = ?received, "Received shutdown signal");
    received
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> ShutdownSignal {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> ShutdownSignal {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(target: "gb28181d", "Failed to listen for Ctrl+C: {}", e);
        // 无法监听信号时不主动退出
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "gb28181d", "Received Ctrl+C");
    ShutdownSignal::Interrupt
}
