//! Scenario driver: builds the per-run context, runs one scenario and always
//! applies the teardown policy, whatever the outcome.

use std::fmt;
use std::fs;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::cluster::Cluster;
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};

const ERROR_DETAIL_LINES: usize = 50;

/// State threaded through one scenario run.
#[derive(Debug)]
pub struct TestContext {
    pub config: HarnessConfig,
    pub cluster: Cluster,
}

impl TestContext {
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        let cluster = Cluster::new(config.clone())?;
        Ok(Self { config, cluster })
    }
}

#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut TestContext) -> HarnessResult<()>;
}

/// Outcome of a scenario run.
#[derive(Debug)]
pub struct Verdict {
    pub scenario: &'static str,
    pub error: Option<HarnessError>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "{}: PASS", self.scenario),
            Some(err) => write!(f, "{}: FAIL: {err}", self.scenario),
        }
    }
}

/// Runs `scenario` against a fresh context built from `config`.
pub async fn execute(scenario: &dyn Scenario, config: HarnessConfig) -> Verdict {
    let name = scenario.name();
    let mut ctx = match TestContext::new(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            return Verdict {
                scenario: name,
                error: Some(err),
            }
        }
    };

    info!(target = "harness::scenario", scenario = name, "BEGIN");
    let outcome = match prepare(&mut ctx).await {
        Ok(()) => scenario.run(&mut ctx).await,
        Err(err) => Err(err),
    };
    if let Err(err) = &outcome {
        error!(target = "harness::scenario", scenario = name, error = %err, "scenario failed");
    }
    if let Err(err) = teardown(&mut ctx, outcome.is_ok()).await {
        warn!(target = "harness::scenario", scenario = name, error = %err, "teardown incomplete");
    }

    let verdict = Verdict {
        scenario: name,
        error: outcome.err(),
    };
    info!(target = "harness::scenario", "{verdict}");
    verdict
}

/// Clears leftovers from earlier runs before anything is launched.
async fn prepare(ctx: &mut TestContext) -> HarnessResult<()> {
    ctx.cluster.killall(ctx.config.run.clean_run).await?;
    ctx.cluster.cleanup()
}

/// Stops processes unless asked to leave them running, dumps log tails on
/// failure when asked to, and removes the work directory only after a
/// successful run without `keep_logs`.
pub async fn teardown(ctx: &mut TestContext, succeeded: bool) -> HarnessResult<()> {
    let run = ctx.config.run.clone();
    if !succeeded && run.dump_error_details {
        for (node_id, tail) in ctx.cluster.stderr_tails(ERROR_DETAIL_LINES) {
            error!(target = "harness::scenario", node = node_id, "stderr tail:\n{tail}");
        }
    }
    if run.leave_running {
        info!(target = "harness::scenario", work_dir = %ctx.config.paths.work_dir.display(), "leaving cluster running");
        return Ok(());
    }
    ctx.cluster.killall(run.clean_run).await?;
    if succeeded && !run.keep_logs {
        let work_dir = &ctx.config.paths.work_dir;
        if work_dir.exists() {
            fs::remove_dir_all(work_dir)?;
        }
    } else {
        info!(target = "harness::scenario", work_dir = %ctx.config.paths.work_dir.display(), "logs preserved");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl Scenario for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn run(&self, _ctx: &mut TestContext) -> HarnessResult<()> {
            Err(HarnessError::validation("balance of testera11111", "97.5321 SYS", "0.0000 SYS"))
        }
    }

    struct Passing;

    #[async_trait]
    impl Scenario for Passing {
        fn name(&self) -> &'static str {
            "passing"
        }

        async fn run(&self, ctx: &mut TestContext) -> HarnessResult<()> {
            fs::create_dir_all(ctx.config.paths.work_dir.join("node_00"))?;
            Ok(())
        }
    }

    fn config(dir: &std::path::Path) -> HarnessConfig {
        let mut config = HarnessConfig::default();
        config.paths.work_dir = dir.join("work");
        config.network.wallet_port = None;
        config
    }

    #[tokio::test]
    async fn failure_keeps_logs_and_reports_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config(dir.path());
        let work_dir = config.paths.work_dir.clone();
        fs::create_dir_all(work_dir.join("stale")).expect("stale dir");

        let verdict = execute(&Failing, config).await;
        assert!(!verdict.passed());
        assert_eq!(verdict.exit_code(), 1);
        let rendered = verdict.to_string();
        assert!(rendered.contains("FAIL"));
        assert!(rendered.contains("expected 97.5321 SYS"));
        // stale state from an earlier run is cleared before the scenario starts
        assert!(!work_dir.join("stale").exists());
    }

    #[tokio::test]
    async fn success_removes_work_dir_unless_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config(dir.path());
        let work_dir = config.paths.work_dir.clone();
        let verdict = execute(&Passing, config.clone()).await;
        assert!(verdict.passed(), "{verdict}");
        assert!(!work_dir.exists());

        let mut keep = config;
        keep.run.keep_logs = true;
        assert!(execute(&Passing, keep).await.passed());
        assert!(work_dir.join("node_00").exists());
    }
}
