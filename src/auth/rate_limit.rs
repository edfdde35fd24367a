// src/auth/rate_limit.rs

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct RateLimiterConfig {
    /// 窗口内允许的请求数
    pub max_requests: u32,
    /// 窗口长度
    pub window: Duration,
    /// 桶表上限，超出时按最久未用淘汰
    pub max_entries: usize,
}

impl RateLimiterConfig {
    /// 配对请求：每 IP 每分钟 5 次
    pub fn pairing() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(60),
            max_entries: 1024,
        }
    }

    /// 登录失败：每 IP 每 15 分钟 5 次
    pub fn login() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(15 * 60),
            max_entries: 1024,
        }
    }
}

struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    rate: f64,
    capacity: f64,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
            rate,
            capacity,
        }
    }

    /// 粗粒度补充：按经过的整秒数回填
    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs() as f64;
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_update = now;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// 按来源 IP 限速。桶表有界，攻击流量不会让内存无限增长
pub struct RateLimiter {
    buckets: RwLock<HashMap<IpAddr, TokenBucket>>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.write().await;

        if !buckets.contains_key(&ip) && buckets.len() >= self.config.max_entries {
            Self::evict_oldest(&mut buckets);
        }

        let rate = self.config.max_requests as f64 / self.config.window.as_secs() as f64;
        let bucket = buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(rate, self.config.max_requests as f64));

        let allowed = bucket.try_consume();
        if !allowed {
            tracing::warn!("Rate limit exceeded for {}", ip);
        }
        allowed
    }

    /// 只探测不消耗：窗口是否已经打满
    pub async fn is_limited(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.write().await;
        match buckets.get_mut(&ip) {
            Some(bucket) => {
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_update).as_secs() as f64;
                (bucket.tokens + elapsed * bucket.rate).min(bucket.capacity) < 1.0
            }
            None => false,
        }
    }

    fn evict_oldest(buckets: &mut HashMap<IpAddr, TokenBucket>) {
        if let Some(oldest) = buckets
            .iter()
            .min_by_key(|(_, b)| b.last_update)
            .map(|(ip, _)| *ip)
        {
            buckets.remove(&oldest);
        }
    }

    /// 惰性清理长期不活跃的桶
    pub async fn cleanup(&self, max_idle: Duration) {
        let mut buckets = self.buckets.write().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_update) < max_idle);
    }

    pub fn start_cleanup_task(self: Arc<Self>) {
        let idle = self.config.window * 2;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                self.cleanup(idle).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn test_allows_up_to_burst() {
        let limiter = RateLimiter::new(RateLimiterConfig::pairing());

        for _ in 0..5 {
            assert!(limiter.check(ip(1)).await);
        }
        // 第 6 个请求被拒绝
        assert!(!limiter.check(ip(1)).await);
    }

    #[tokio::test]
    async fn test_limits_are_per_ip() {
        let limiter = RateLimiter::new(RateLimiterConfig::pairing());

        for _ in 0..5 {
            assert!(limiter.check(ip(1)).await);
        }
        assert!(!limiter.check(ip(1)).await);
        assert!(limiter.check(ip(2)).await);
    }

    #[tokio::test]
    async fn test_bucket_table_is_bounded() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            max_entries: 8,
        });

        for last in 0..32 {
            limiter.check(ip(last)).await;
        }
        assert!(limiter.buckets.read().await.len() <= 8);
    }
}
