// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Sliding-window rate limiting backed by Redis with an in-process fallback.
//!
//! Each `(action, identifier)` pair keeps the timestamps of its recent
//! requests. In Redis they live in a sorted set scored by time; in memory
//! they live in a `DashMap` shared by all request handlers.
//!
//! Redis is optional. If it cannot be reached at startup, or any command
//! fails later, the service logs a warning and answers every subsequent
//! check from memory for the rest of the process lifetime.
//!
//! In-memory windows whose newest request has expired are swept out every
//! [`SWEEP_INTERVAL`] checks, so one-off clients do not accumulate.

use crate::config::RedisSettings;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// In-memory checks between sweeps of expired windows.
pub const SWEEP_INTERVAL: u64 = 1024;

/// Limit for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub action: &'static str,
    /// Maximum requests inside the window
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

/// Configured limits, by action name.
pub const RATE_LIMITS: [RateLimitRule; 2] = [
    RateLimitRule {
        action: "prediction",
        limit: 100,
        window_secs: 3600,
    },
    RateLimitRule {
        action: "upload",
        limit: 50,
        window_secs: 3600,
    },
];

pub fn rule_for(action: &str) -> Option<RateLimitRule> {
    RATE_LIMITS.iter().copied().find(|r| r.action == action)
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed {
        remaining: u32,
        limit: u32,
        window_secs: u64,
    },
    Limited {
        /// Seconds until the oldest request leaves the window
        retry_after: u64,
        limit: u32,
        window_secs: u64,
    },
}

impl RateLimitDecision {
    pub fn is_limited(&self) -> bool {
        matches!(self, RateLimitDecision::Limited { .. })
    }
}

/// Recent requests for one `(action, identifier)` pair.
#[derive(Debug, Default)]
struct MemoryWindow {
    window_secs: f64,
    timestamps: Vec<f64>,
}

impl MemoryWindow {
    fn is_expired(&self, now: f64) -> bool {
        self.timestamps.iter().all(|&t| t <= now - self.window_secs)
    }
}

/// Rate limiter shared through application state.
pub struct RateLimitService {
    redis: RwLock<Option<ConnectionManager>>,
    memory: DashMap<String, MemoryWindow>,
    memory_checks: AtomicU64,
    /// Disambiguates sorted-set members recorded in the same instant
    sequence: AtomicU64,
}

impl RateLimitService {
    /// Connect to Redis, falling back to memory if it is unreachable.
    pub async fn connect(settings: &RedisSettings) -> Self {
        let service = Self::in_memory();
        match open_redis(settings).await {
            Ok(conn) => {
                tracing::info!("Connected to Redis for rate limiting");
                *service.redis.write().await = Some(conn);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis not available, using in-memory rate limiting");
            }
        }
        service
    }

    /// Memory-only limiter.
    pub fn in_memory() -> Self {
        Self {
            redis: RwLock::new(None),
            memory: DashMap::new(),
            memory_checks: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    /// Name of the active backend.
    pub async fn backend(&self) -> &'static str {
        if self.redis.read().await.is_some() {
            "redis"
        } else {
            "memory"
        }
    }

    /// Record a request for `action` and decide whether it may proceed.
    ///
    /// Returns `None` for actions without a configured limit.
    pub async fn check(&self, identifier: &str, action: &str) -> Option<RateLimitDecision> {
        let rule = rule_for(action)?;
        Some(self.check_rule(identifier, rule, unix_now()).await)
    }

    /// Check against an explicit rule at time `now` (Unix seconds).
    pub async fn check_rule(
        &self,
        identifier: &str,
        rule: RateLimitRule,
        now: f64,
    ) -> RateLimitDecision {
        let conn = self.redis.read().await.clone();
        if let Some(mut conn) = conn {
            let member = format!("{:.6}:{}", now, self.sequence.fetch_add(1, Ordering::Relaxed));
            match check_redis(&mut conn, identifier, rule, now, &member).await {
                Ok(decision) => return decision,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        action = rule.action,
                        "Redis rate limit check failed, falling back to in-memory"
                    );
                    *self.redis.write().await = None;
                }
            }
        }
        self.check_memory(identifier, rule, now)
    }

    fn check_memory(&self, identifier: &str, rule: RateLimitRule, now: f64) -> RateLimitDecision {
        // Must run before taking an entry guard below
        if (self.memory_checks.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_INTERVAL == 0 {
            self.sweep_memory(now);
        }

        let key = format!("{}:{}", rule.action, identifier);
        let window = rule.window_secs as f64;
        let mut entry = self.memory.entry(key).or_default();
        entry.window_secs = window;

        let timestamps = &mut entry.timestamps;
        timestamps.retain(|&t| t > now - window);

        if timestamps.len() >= rule.limit as usize {
            let oldest = timestamps.iter().cloned().fold(f64::INFINITY, f64::min);
            return limited(rule, oldest, now);
        }

        timestamps.push(now);
        RateLimitDecision::Allowed {
            remaining: rule.limit.saturating_sub(timestamps.len() as u32),
            limit: rule.limit,
            window_secs: rule.window_secs,
        }
    }

    /// Drop in-memory windows with no request left inside them.
    fn sweep_memory(&self, now: f64) {
        let before = self.memory.len();
        self.memory.retain(|_, window| !window.is_expired(now));
        tracing::debug!(
            removed = before.saturating_sub(self.memory.len()),
            remaining = self.memory.len(),
            "Swept expired rate limit windows"
        );
    }
}

fn limited(rule: RateLimitRule, oldest: f64, now: f64) -> RateLimitDecision {
    let reset_in = (oldest + rule.window_secs as f64 - now).ceil();
    RateLimitDecision::Limited {
        retry_after: if reset_in >= 1.0 { reset_in as u64 } else { 1 },
        limit: rule.limit,
        window_secs: rule.window_secs,
    }
}

async fn open_redis(settings: &RedisSettings) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(settings.url())?;
    let connect = async {
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(conn)
    };

    match tokio::time::timeout(REDIS_CONNECT_TIMEOUT, connect).await {
        Ok(result) => result,
        Err(_) => Err(redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out connecting to Redis",
        ))),
    }
}

async fn check_redis(
    conn: &mut ConnectionManager,
    identifier: &str,
    rule: RateLimitRule,
    now: f64,
    member: &str,
) -> Result<RateLimitDecision, redis::RedisError> {
    let key = format!("rate_limit:{}:{}", rule.action, identifier);
    let min_score = now - rule.window_secs as f64;

    let (count,): (u64,) = redis::pipe()
        .atomic()
        .cmd("ZREMRANGEBYSCORE")
        .arg(&key)
        .arg("-inf")
        .arg(min_score)
        .ignore()
        .cmd("ZCARD")
        .arg(&key)
        .query_async(conn)
        .await?;

    if count >= rule.limit as u64 {
        let oldest: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(conn)
            .await?;
        let oldest = oldest.first().map(|(_, score)| *score).unwrap_or(now);
        return Ok(limited(rule, oldest, now));
    }

    redis::pipe()
        .atomic()
        .cmd("ZADD")
        .arg(&key)
        .arg(now)
        .arg(member)
        .ignore()
        .cmd("EXPIRE")
        .arg(&key)
        .arg(rule.window_secs)
        .ignore()
        .query_async::<()>(conn)
        .await?;

    Ok(RateLimitDecision::Allowed {
        remaining: rule.limit.saturating_sub(count as u32 + 1),
        limit: rule.limit,
        window_secs: rule.window_secs,
    })
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULE: RateLimitRule = RateLimitRule {
        action: "test",
        limit: 3,
        window_secs: 60,
    };

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let limiter = RateLimitService::in_memory();

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_rule("1.2.3.4", RULE, 1000.0).await;
            assert_eq!(
                decision,
                RateLimitDecision::Allowed {
                    remaining: expected_remaining,
                    limit: 3,
                    window_secs: 60
                }
            );
        }

        let decision = limiter.check_rule("1.2.3.4", RULE, 1010.0).await;
        assert_eq!(
            decision,
            RateLimitDecision::Limited {
                retry_after: 50,
                limit: 3,
                window_secs: 60
            }
        );
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimitService::in_memory();
        limiter.check_rule("a", RULE, 0.0).await;
        limiter.check_rule("a", RULE, 30.0).await;
        limiter.check_rule("a", RULE, 40.0).await;
        assert!(limiter.check_rule("a", RULE, 59.0).await.is_limited());

        // First request (t=0) has left the window
        let decision = limiter.check_rule("a", RULE, 60.5).await;
        assert!(!decision.is_limited());
    }

    #[tokio::test]
    async fn test_identifiers_and_actions_are_independent() {
        let limiter = RateLimitService::in_memory();
        for _ in 0..3 {
            limiter.check_rule("a", RULE, 5.0).await;
        }
        assert!(limiter.check_rule("a", RULE, 5.0).await.is_limited());
        assert!(!limiter.check_rule("b", RULE, 5.0).await.is_limited());

        let other = RateLimitRule {
            action: "other",
            ..RULE
        };
        assert!(!limiter.check_rule("a", other, 5.0).await.is_limited());
    }

    #[tokio::test]
    async fn test_retry_after_is_at_least_one_second() {
        let limiter = RateLimitService::in_memory();
        for _ in 0..3 {
            limiter.check_rule("a", RULE, 100.0).await;
        }
        match limiter.check_rule("a", RULE, 159.9).await {
            RateLimitDecision::Limited { retry_after, .. } => assert_eq!(retry_after, 1),
            other => panic!("expected limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_not_limited() {
        let limiter = RateLimitService::in_memory();
        assert!(limiter.check("a", "login").await.is_none());
        assert!(limiter.check("a", "prediction").await.is_some());
        assert_eq!(limiter.backend().await, "memory");
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back() {
        let settings = RedisSettings::Url("redis://127.0.0.1:1/0".to_string());
        let limiter = RateLimitService::connect(&settings).await;
        assert_eq!(limiter.backend().await, "memory");
        assert!(!limiter.check_rule("a", RULE, 1.0).await.is_limited());
    }

    #[tokio::test]
    async fn test_expired_windows_are_swept() {
        let limiter = RateLimitService::in_memory();
        for i in 0..10_000 {
            limiter.check_rule(&format!("10.0.{}.{}", i / 256, i % 256), RULE, 0.0).await;
        }
        assert_eq!(limiter.memory.len(), 10_000);

        for _ in 0..SWEEP_INTERVAL {
            limiter.check_rule("a", RULE, 10_000.0).await;
        }
        assert_eq!(limiter.memory.len(), 1);
        assert!(limiter.memory.contains_key("test:a"));
    }

    #[tokio::test]
    async fn test_sweep_keeps_live_windows() {
        let limiter = RateLimitService::in_memory();
        for _ in 0..3 {
            limiter.check_rule("busy", RULE, 100.0).await;
        }
        limiter.check_rule("idle", RULE, 0.0).await;

        limiter.sweep_memory(120.0);
        assert!(limiter.memory.contains_key("test:busy"));
        assert!(!limiter.memory.contains_key("test:idle"));
        // Still limited after the sweep
        assert!(limiter.check_rule("busy", RULE, 120.0).await.is_limited());
    }

    /// Length of the first complete RESP command in `buf`.
    fn resp_command_len(buf: &[u8]) -> Option<usize> {
        fn header(buf: &[u8], pos: usize, prefix: u8) -> Option<(usize, usize)> {
            if *buf.get(pos)? != prefix {
                return None;
            }
            let end = pos + buf[pos..].windows(2).position(|w| w == b"\r\n")?;
            let n = std::str::from_utf8(&buf[pos + 1..end]).ok()?.parse().ok()?;
            Some((n, end + 2))
        }

        let (count, mut pos) = header(buf, 0, b'*')?;
        for _ in 0..count {
            let (len, next) = header(buf, pos, b'$')?;
            pos = next + len + 2;
            if buf.len() < pos {
                return None;
            }
        }
        Some(pos)
    }

    /// Server that speaks just enough RESP to accept a connection and a
    /// PING, then answers `+OK` to everything, including a transaction's
    /// EXEC, which the client cannot parse.
    async fn start_broken_redis() -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut read = [0u8; 4096];
                    loop {
                        while let Some(n) = resp_command_len(&buf) {
                            buf.drain(..n);
                            if socket.write_all(b"+OK\r\n").await.is_err() {
                                return;
                            }
                        }
                        match socket.read(&mut read).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&read[..n]),
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn test_resp_command_framing() {
        let ping = b"*1\r\n$4\r\nPING\r\n";
        assert_eq!(resp_command_len(ping), Some(ping.len()));
        assert_eq!(resp_command_len(&ping[..8]), None);
    }

    #[tokio::test]
    async fn test_redis_error_mid_run_falls_back_to_memory() {
        let addr = start_broken_redis().await;
        let settings = RedisSettings::Url(format!("redis://{}/0", addr));

        tokio::time::timeout(Duration::from_secs(10), async {
            let limiter = RateLimitService::connect(&settings).await;
            assert_eq!(limiter.backend().await, "redis");

            let decision = limiter.check_rule("a", RULE, 1.0).await;
            assert_eq!(
                decision,
                RateLimitDecision::Allowed {
                    remaining: 2,
                    limit: 3,
                    window_secs: 60
                }
            );
            assert_eq!(limiter.backend().await, "memory");

            // Later checks keep counting in memory
            limiter.check_rule("a", RULE, 2.0).await;
            limiter.check_rule("a", RULE, 3.0).await;
            assert!(limiter.check_rule("a", RULE, 4.0).await.is_limited());
        })
        .await
        .expect("fallback finished in time");
    }

    #[test]
    fn test_configured_rules() {
        assert_eq!(rule_for("prediction").map(|r| r.limit), Some(100));
        assert_eq!(rule_for("upload").map(|r| r.window_secs), Some(3600));
        assert!(rule_for("export").is_none());
    }
}
