//! 按客户端地址与路由规则计数的固定窗口限流。

use axum::body::Body as AxumBody;
use axum::extract::State;
use axum::http::Request;
use axum::{middleware, response::Response};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ApiError;
use crate::http::client_key;

/// 单条限流规则：窗口内允许的最大请求数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    max_requests: u32,
    window: Duration,
}

impl Limit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn per_hour(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60 * 60))
    }

    pub fn per_day(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(24 * 60 * 60))
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {}s", self.max_requests, self.window.as_secs())
    }
}

/// Accepts `"10 per minute"`, `"10/minute"` and plural units.
impl FromStr for Limit {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        let (count, unit) = value
            .split_once(" per ")
            .or_else(|| value.split_once('/'))
            .ok_or_else(|| format!("expected `<count> per <unit>`, got `{value}`"))?;
        let count = count
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid request count in `{value}`"))?;
        if count == 0 {
            return Err(format!("request count must be positive in `{value}`"));
        }
        let unit = unit.trim();
        let unit = unit.strip_suffix('s').unwrap_or(unit);
        match unit {
            "second" | "sec" => Ok(Limit::per_second(count)),
            "minute" | "min" => Ok(Limit::per_minute(count)),
            "hour" => Ok(Limit::per_hour(count)),
            "day" => Ok(Limit::per_day(count)),
            other => Err(format!("unknown time unit `{other}`")),
        }
    }
}

/// 路由规则：名称用于隔离各端点的计数。
#[derive(Debug, Clone)]
pub struct Rule {
    name: &'static str,
    limits: Vec<Limit>,
}

impl Rule {
    pub fn new(name: &'static str, limits: Vec<Limit>) -> Self {
        Self { name, limits }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    rule: &'static str,
    slot: usize,
    client: String,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    length: Duration,
    count: u32,
}

impl Window {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.length
    }

    fn retry_after(&self, now: Instant) -> u64 {
        let reset_at = self.started + self.length;
        reset_at.saturating_duration_since(now).as_secs().max(1)
    }
}

/// Process-local counters; not shared between instances.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<CounterKey, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// 检查并计数；任一限制超限时不计数，返回需等待的秒数。
    pub async fn check_and_consume(&self, client: &str, rule: &Rule) -> Result<(), u64> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();

        let mut retry_after = None;
        for (slot, limit) in rule.limits.iter().enumerate() {
            let key = CounterKey {
                rule: rule.name,
                slot,
                client: client.to_string(),
            };
            if let Some(window) = windows.get(&key)
                && !window.is_expired(now)
                && window.count >= limit.max_requests
            {
                let wait = window.retry_after(now);
                retry_after = Some(retry_after.map_or(wait, |current: u64| current.max(wait)));
            }
        }
        if let Some(wait) = retry_after {
            return Err(wait);
        }

        for (slot, limit) in rule.limits.iter().enumerate() {
            let key = CounterKey {
                rule: rule.name,
                slot,
                client: client.to_string(),
            };
            let window = windows.entry(key).or_insert(Window {
                started: now,
                length: limit.window,
                count: 0,
            });
            if window.is_expired(now) {
                window.started = now;
                window.count = 0;
            }
            window.count = window.count.saturating_add(1);
        }

        Ok(())
    }

    /// 清理已过期的计数窗口。
    pub async fn prune_expired(&self) -> usize {
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        let now = Instant::now();
        windows.retain(|_, window| !window.is_expired(now));
        before - windows.len()
    }
}

/// 中间件状态：共享计数器 + 该路由的规则。
#[derive(Clone)]
pub struct Throttle {
    limiter: Arc<RateLimiter>,
    rule: Arc<Rule>,
    trust_proxy: bool,
}

impl Throttle {
    pub fn new(limiter: Arc<RateLimiter>, rule: Rule, trust_proxy: bool) -> Self {
        Self {
            limiter,
            rule: Arc::new(rule),
            trust_proxy,
        }
    }
}

/// 限流中间件：超限请求在到达认证与处理器之前被拒绝。
pub async fn throttle(
    State(throttle): State<Throttle>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let client = client_key(&req, throttle.trust_proxy);
    if let Err(retry_after) = throttle
        .limiter
        .check_and_consume(&client, &throttle.rule)
        .await
    {
        warn!(
            client_ip = %client,
            rule = throttle.rule.name(),
            retry_after,
            "rate limit exceeded"
        );
        return Err(ApiError::TooManyRequests(retry_after));
    }
    Ok(next.run(req).await)
}
