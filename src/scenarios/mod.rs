//! Built-in end-to-end scenarios.

pub mod launcher;
pub mod snapshot;

use crate::config::HarnessConfig;
use crate::scenario::Scenario;

pub use launcher::LauncherScenario;
pub use snapshot::SnapshotDeterminismScenario;

/// Names accepted by [`by_name`].
pub const SCENARIO_NAMES: &[&str] = &["launcher", "snapshot-determinism"];

/// Looks up a built-in scenario by its CLI name. Node flags shared by every
/// node in `config` are appended to the scenario's own topology.
pub fn by_name(name: &str, config: &HarnessConfig) -> Option<Box<dyn Scenario>> {
    let common = config.topology.common_args.clone();
    match name {
        "launcher" => {
            let mut scenario = LauncherScenario::default();
            scenario.topology = scenario.topology.with_common_args(common);
            Some(Box::new(scenario))
        }
        "snapshot-determinism" => {
            let mut scenario = SnapshotDeterminismScenario::default();
            scenario.topology = scenario.topology.with_common_args(common);
            Some(Box::new(scenario))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenarios_are_found_by_cli_name() {
        let config = HarnessConfig::default();
        for name in SCENARIO_NAMES {
            assert_eq!(by_name(name, &config).map(|s| s.name()), Some(*name));
        }
        assert!(by_name("unknown", &config).is_none());
    }

    #[test]
    fn irreversible_reader_keeps_its_read_mode_after_common_args() {
        let mut config = HarnessConfig::default();
        config.topology.common_args = vec!["--block-interval-ms".to_string(), "100".to_string()];
        let mut scenario = SnapshotDeterminismScenario::default();
        scenario.topology = scenario
            .topology
            .with_common_args(config.topology.common_args.clone());
        let args = scenario.topology.args_for(1);
        assert_eq!(args.first().map(String::as_str), Some("--block-interval-ms"));
        assert!(args.ends_with(&["--read-mode".to_string(), "irreversible".to_string()]));
    }
}
