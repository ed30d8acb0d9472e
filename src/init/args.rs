// SPDX-License-Identifier: Apache-2.0

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Config file, or a directory whose files are merged in name order
    #[arg(long, short = 'c', env = "LOGSHIP_CONFIG")]
    pub config: PathBuf,

    /// File storing the last delivered offset of every harvested file
    #[arg(
        long,
        env = "LOGSHIP_OFFSETS_PATH",
        default_value = ".logship-offsets.json"
    )]
    pub offsets_path: PathBuf,

    /// Start files that appear while running at their end instead of their beginning
    #[arg(long, env = "LOGSHIP_TAIL_NEW_FILES", default_value = "false")]
    pub tail_new_files: bool,

    /// Time between scans for new files
    #[arg(long, env = "LOGSHIP_SCAN_INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)]
    pub scan_interval: Duration,

    /// Number of events published as one batch
    #[arg(long, env = "LOGSHIP_SPOOL_SIZE", default_value = "1024")]
    pub spool_size: usize,

    /// Publish a partial batch after this much time without new events
    #[arg(long, env = "LOGSHIP_IDLE_FLUSH", default_value = "5s", value_parser = humantime::parse_duration)]
    pub idle_flush: Duration,

    /// Events buffered between harvesters and the publisher
    #[arg(long, env = "LOGSHIP_EVENT_QUEUE_SIZE", default_value = "1000")]
    pub event_queue_size: usize,
}
