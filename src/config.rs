//! Configuration for the worker pool.

use std::time::Duration;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Endpoint used to negotiate an authenticated session.
    pub session_url: String,
    /// Ping endpoints, tried in declaration order for each heartbeat.
    pub ping_urls: Vec<String>,
    /// Maximum number of concurrently active workers.
    pub max_connections: usize,
    /// Interval between heartbeats of one worker.
    pub ping_interval: Duration,
    /// Retry ceiling for a single heartbeat.
    pub max_retries: u32,
    /// Base of the exponential backoff applied between ping retries.
    pub backoff_base: u32,
    /// URL probed through a candidate egress before admission.
    pub validate_url: String,
    /// Timeout for the admission probe.
    pub validate_timeout: Duration,
    /// Timeout for session and ping calls.
    pub api_timeout: Duration,
    /// Pause between scheduler iterations.
    pub scheduler_pause: Duration,
    /// User-Agent header sent on every remote call.
    pub user_agent: String,
    /// Origin header, if the remote expects one.
    pub origin: Option<String>,
    /// Referer header, if the remote expects one.
    pub referer: Option<String>,
}

impl PoolConfig {
    /// Create a new configuration builder for the given remote endpoints.
    pub fn builder(
        session_url: impl Into<String>,
        ping_urls: Vec<impl Into<String>>,
    ) -> PoolConfigBuilder {
        PoolConfigBuilder::new(session_url, ping_urls)
    }
}

/// Builder for `PoolConfig`.
pub struct PoolConfigBuilder {
    session_url: String,
    ping_urls: Vec<String>,
    max_connections: Option<usize>,
    ping_interval: Option<Duration>,
    max_retries: Option<u32>,
    backoff_base: Option<u32>,
    validate_url: Option<String>,
    validate_timeout: Option<Duration>,
    api_timeout: Option<Duration>,
    scheduler_pause: Option<Duration>,
    user_agent: Option<String>,
    origin: Option<String>,
    referer: Option<String>,
}

impl PoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new(session_url: impl Into<String>, ping_urls: Vec<impl Into<String>>) -> Self {
        Self {
            session_url: session_url.into(),
            ping_urls: ping_urls.into_iter().map(Into::into).collect(),
            max_connections: None,
            ping_interval: None,
            max_retries: None,
            backoff_base: None,
            validate_url: None,
            validate_timeout: None,
            api_timeout: None,
            scheduler_pause: None,
            user_agent: None,
            origin: None,
            referer: None,
        }
    }

    /// Set the maximum number of concurrently active workers.
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = Some(count);
        self
    }

    /// Set the interval between heartbeats of one worker.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// Set the retry ceiling for a single heartbeat.
    pub fn max_retries(mut self, count: u32) -> Self {
        self.max_retries = Some(count);
        self
    }

    /// Set the base of the exponential backoff between ping retries.
    pub fn backoff_base(mut self, base: u32) -> Self {
        self.backoff_base = Some(base);
        self
    }

    /// Set the URL probed through a candidate egress before admission.
    pub fn validate_url(mut self, url: impl Into<String>) -> Self {
        self.validate_url = Some(url.into());
        self
    }

    /// Set the timeout for the admission probe.
    pub fn validate_timeout(mut self, timeout: Duration) -> Self {
        self.validate_timeout = Some(timeout);
        self
    }

    /// Set the timeout for session and ping calls.
    pub fn api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = Some(timeout);
        self
    }

    /// Set the pause between scheduler iterations.
    pub fn scheduler_pause(mut self, pause: Duration) -> Self {
        self.scheduler_pause = Some(pause);
        self
    }

    /// Set the User-Agent header sent on every remote call.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Set the Origin header sent on every remote call.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set the Referer header sent on every remote call.
    pub fn referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        PoolConfig {
            session_url: self.session_url,
            ping_urls: self.ping_urls,
            max_connections: self.max_connections.unwrap_or(15),
            ping_interval: self.ping_interval.unwrap_or(Duration::from_secs(30)),
            max_retries: self.max_retries.unwrap_or(3),
            backoff_base: self.backoff_base.unwrap_or(2),
            validate_url: self
                .validate_url
                .unwrap_or_else(|| "http://example.com".to_string()),
            validate_timeout: self.validate_timeout.unwrap_or(Duration::from_secs(5)),
            api_timeout: self.api_timeout.unwrap_or(Duration::from_secs(10)),
            scheduler_pause: self.scheduler_pause.unwrap_or(Duration::from_secs(3)),
            user_agent: self.user_agent.unwrap_or_else(|| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36"
                    .to_string()
            }),
            origin: self.origin,
            referer: self.referer,
        }
    }
}
