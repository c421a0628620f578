use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Tuning for the background fleet monitor.
///
/// The thresholds are empirical defaults; every one of them can be
/// overridden from the command line.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between two monitor cycles
    pub interval: Duration,
    /// Queued jobs waiting longer than this are candidates for migration
    pub starvation_threshold: Duration,
    /// A migrated job is not migrated again until this much time has passed
    pub migration_cooldown: Duration,
    /// A run of MORE than this many consecutive same-requester jobs
    /// triggers fairness reordering
    pub fairness_block_len: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            starvation_threshold: Duration::from_secs(30),
            migration_cooldown: Duration::from_secs(300),
            fairness_block_len: 2,
        }
    }
}

/// Per-worker processing loop settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Delay between checks while waiting for a busy job-type slot to free
    pub slot_poll_interval: Duration,
    /// Delay before the supervisor restarts a loop that exited unexpectedly
    pub restart_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            slot_poll_interval: Duration::from_millis(250),
            restart_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Close a worker connection that sends nothing for this long
    pub idle_timeout: Duration,
    /// Bound of the per-connection outbound frame channel
    pub outbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            outbound_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    /// Bearer credentials accepted from workers
    pub auth_tokens: HashSet<String>,
    pub monitor: MonitorConfig,
    pub processor: ProcessorConfig,
    pub connection: ConnectionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8765"
                .parse()
                .expect("default listen address is valid"),
            auth_tokens: HashSet::new(),
            monitor: MonitorConfig::default(),
            processor: ProcessorConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_tokens.insert(token.into());
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}
