//! Runtime configuration for the session and data tiers.
//!
//! Everything is serde-loadable with full defaults so an empty config file
//! yields a working node.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub data: DataConfig,
    pub logging: LoggingConfig,
}

/// Session-tier knobs: push pipeline and local data center identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Data center this session node serves.
    pub data_center: String,
    /// Start with outbound pushes disabled until explicitly resumed.
    pub stop_push_on_startup: bool,
    /// Max retries for a failed or conflicted push task.
    pub push_retry_max: u32,
    /// Delay before a pending push task becomes eligible for commit.
    pub push_task_expire_ms: u64,
    /// Push watchdog tick; upper bound on reaction latency to new tasks.
    pub push_watchdog_interval_ms: u64,
    pub push_executor_threads: usize,
    pub push_executor_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_center: "DefaultDataCenter".to_string(),
            stop_push_on_startup: false,
            push_retry_max: 3,
            push_task_expire_ms: 500,
            push_watchdog_interval_ms: 100,
            push_executor_threads: 6,
            push_executor_queue: 4000,
        }
    }
}

/// Data-tier knobs: slot table shape, sync cadences, executor sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Fixed slot count; must agree across every node of the deployment.
    pub slot_count: u32,
    pub slot_leader_sync_session_interval_secs: u64,
    pub slot_follower_sync_leader_interval_secs: u64,
    /// Slot watchdog tick; upper bound on reaction latency to table updates.
    pub slot_watchdog_interval_ms: u64,
    pub migrate_session_executor_threads: usize,
    pub migrate_session_executor_queue: usize,
    pub sync_session_executor_threads: usize,
    pub sync_session_executor_queue: usize,
    pub sync_leader_executor_threads: usize,
    pub sync_leader_executor_queue: usize,
    /// Max dataInfoIds per diff-sync page.
    pub sync_page_size: usize,
    pub session_lease_secs: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            slot_count: 256,
            slot_leader_sync_session_interval_secs: 10,
            slot_follower_sync_leader_interval_secs: 60,
            slot_watchdog_interval_ms: 200,
            migrate_session_executor_threads: 8,
            migrate_session_executor_queue: 512,
            sync_session_executor_threads: 8,
            sync_session_executor_queue: 512,
            sync_leader_executor_threads: 4,
            sync_leader_executor_queue: 256,
            sync_page_size: 512,
            session_lease_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<std::path::PathBuf>,
    pub format: LogFormat,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
        }
    }
}
