//! Ledger-specific post-conditions. Every failure is a
//! [`HarnessError::Validation`] carrying the expected and actual values.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{info, warn};

use crate::asset::Asset;
use crate::errors::{HarnessError, HarnessResult};
use crate::node::{NodeClient, SnapshotFile};
use crate::transaction::TransactionRecord;

/// Fails unless the node reports exactly `expected` for `account_name`.
pub async fn assert_balance(client: &NodeClient, account_name: &str, expected: &str) -> HarnessResult<()> {
    let expected_asset = Asset::parse(expected)?;
    let actual = client.get_account_asset(account_name).await?;
    if actual != expected_asset {
        return Err(HarnessError::validation(
            format!("balance of {account_name}"),
            expected_asset,
            actual,
        ));
    }
    info!(target = "harness::assert", account = account_name, balance = %actual, "balance verified");
    Ok(())
}

/// Fails unless the first action of `record` is `action` moving exactly
/// `quantity_units` minor units.
pub fn assert_transfer_action(record: &TransactionRecord, action: &str, quantity_units: i64) -> HarnessResult<()> {
    let first = record.first_action()?;
    if first.action != action {
        return Err(HarnessError::validation(
            format!("action name of transaction {}", record.id),
            action,
            &first.action,
        ));
    }
    let units = first.quantity_units()?;
    if units != quantity_units {
        return Err(HarnessError::validation(
            format!("quantity of transaction {}", record.id),
            quantity_units,
            units,
        ));
    }
    Ok(())
}

/// Fails unless both snapshot files hold byte-identical content.
pub fn assert_snapshots_identical(before: &SnapshotFile, after: &SnapshotFile) -> HarnessResult<()> {
    let left = before.read()?;
    let right = after.read()?;
    if left != right {
        let first_difference = left
            .iter()
            .zip(right.iter())
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| left.len().min(right.len()));
        return Err(HarnessError::validation(
            format!(
                "snapshot {} against {}",
                after.path.display(),
                before.path.display()
            ),
            format!("{} identical bytes", left.len()),
            format!("{} bytes, first difference at offset {first_difference}", right.len()),
        ));
    }
    info!(
        target = "harness::assert",
        bytes = left.len(),
        block = after.block_num,
        "snapshots are byte-identical"
    );
    Ok(())
}

/// Lines of `log_path` containing `marker`. A missing log yields no lines.
pub fn scan_log_markers(log_path: &Path, marker: &str) -> HarnessResult<Vec<String>> {
    let file = match File::open(log_path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut hits = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.contains(marker) {
            hits.push(line);
        }
    }
    Ok(hits)
}

/// Logs a warning when `log_path` contains assertion markers. Never fails the run.
pub fn warn_on_log_asserts(log_path: &Path) -> HarnessResult<usize> {
    let hits = scan_log_markers(log_path, "Assert")?;
    if !hits.is_empty() {
        warn!(
            target = "harness::assert",
            log = %log_path.display(),
            count = hits.len(),
            first = %hits[0],
            "assertion markers found in node log"
        );
    }
    Ok(hits.len())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::transaction::ActionRecord;

    fn record(action: &str, quantity: &str) -> TransactionRecord {
        TransactionRecord {
            id: "abc".to_string(),
            block_num: 7,
            actions: vec![ActionRecord {
                contract: "eosio.token".to_string(),
                action: action.to_string(),
                params: json!({"quantity": quantity}),
            }],
        }
    }

    fn snapshot(path: PathBuf) -> SnapshotFile {
        SnapshotFile {
            path,
            chain_id: "chain".to_string(),
            block_num: 10,
            head_block_id: "00".to_string(),
        }
    }

    #[test]
    fn transfer_action_compares_minor_units() {
        assert_transfer_action(&record("transfer", "97.5311 SYS"), "transfer", 975_311).expect("match");
        let err = assert_transfer_action(&record("transfer", "97.5310 SYS"), "transfer", 975_311)
            .expect_err("off by one unit");
        assert!(err.to_string().contains("expected 975311"));
        assert!(assert_transfer_action(&record("issue", "97.5311 SYS"), "transfer", 975_311).is_err());
    }

    #[test]
    fn snapshot_comparison_is_bytewise() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        let c = dir.path().join("c.json");
        fs::write(&a, b"{\"state\":1}").expect("write");
        fs::write(&b, b"{\"state\":1}").expect("write");
        fs::write(&c, b"{\"state\":2}").expect("write");

        assert_snapshots_identical(&snapshot(a.clone()), &snapshot(b)).expect("identical");
        let err = assert_snapshots_identical(&snapshot(a), &snapshot(c)).expect_err("differs");
        assert!(err.to_string().contains("offset 9"), "{err}");
    }

    #[test]
    fn log_markers_are_warnings_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("stderr.txt");
        fs::write(&log, "info ok\nerror Assert failed: x\nAssertion\n").expect("write");
        assert_eq!(scan_log_markers(&log, "Assert").expect("scan").len(), 2);
        assert_eq!(warn_on_log_asserts(&log).expect("warn"), 2);
        assert_eq!(warn_on_log_asserts(&dir.path().join("missing.txt")).expect("missing"), 0);
    }
}
