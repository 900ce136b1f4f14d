//! 限流计数的后台清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::RATE_PRUNE_INTERVAL_SECS;
use crate::rate_limit::RateLimiter;

/// 定期清理过期的限流窗口，避免内存随客户端数量增长。
pub fn spawn_background_tasks(limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(RATE_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let removed = limiter.prune_expired().await;
            if removed > 0 {
                debug!(removed, "pruned expired rate limit windows");
            }
        }
    });
}
