//! Startup configuration, captured once into a struct and never mutated.

use applog::{LogConfig, StrategyKind, Tick};
use std::path::PathBuf;
use std::time::Duration;

/// Pre-population of synthetic keys at startup, for evaluation runs.
#[derive(Clone, Copy, Debug)]
pub struct PreInitialize {
    pub keys: usize,
    pub value_size: usize,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub node_id: String,
    pub strategy: StrategyKind,
    pub tick: Tick,
    pub period: usize,
    pub shards: usize,
    pub circ_capacity: usize,
    /// Gzip values on their way into the map.
    pub compress_values: bool,
    pub pre_initialize: Option<PreInitialize>,
    /// O_SYNC disk writes, so crashes of the whole cluster stay recoverable.
    pub catastrophic_faults: bool,
    /// Deadline on the consensus apply future.
    pub apply_timeout: Duration,
    /// When set, overrides `strategy` to the traditional disk log, appended
    /// under this folder.
    pub log_folder: Option<PathBuf>,
    /// Flush target for the reducing strategies that persist their views.
    pub log_fname: Option<PathBuf>,
    pub join_handler_addr: Option<String>,
    pub recov_handler_addr: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            strategy: StrategyKind::ConcTable,
            tick: Tick::Interval,
            period: 4000,
            shards: 4,
            circ_capacity: 4000,
            compress_values: false,
            pre_initialize: None,
            catastrophic_faults: false,
            apply_timeout: Duration::from_secs(10),
            log_folder: None,
            log_fname: None,
            join_handler_addr: None,
            recov_handler_addr: None,
        }
    }
}

impl StoreConfig {
    /// The strategy actually run, after the disk-folder override.
    pub fn effective_strategy(&self) -> StrategyKind {
        if self.log_folder.is_some() {
            StrategyKind::DiskTrad
        } else {
            self.strategy
        }
    }

    pub fn log_config(&self) -> LogConfig {
        let fname = match self.effective_strategy() {
            StrategyKind::DiskTrad => self
                .log_folder
                .as_ref()
                .map(|dir| dir.join(format!("logfile-{}.log", self.node_id))),
            _ => self.log_fname.clone(),
        };
        LogConfig {
            tick: self.tick,
            period: self.period,
            shards: self.shards,
            capacity: self.circ_capacity,
            fname,
            sync_writes: self.catastrophic_faults,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_folder_forces_the_disk_strategy() {
        let config = StoreConfig {
            node_id: "node0".into(),
            log_folder: Some(PathBuf::from("/tmp/logs")),
            ..Default::default()
        };
        assert_eq!(config.effective_strategy(), StrategyKind::DiskTrad);
        assert_eq!(
            config.log_config().fname,
            Some(PathBuf::from("/tmp/logs/logfile-node0.log"))
        );
    }
}
