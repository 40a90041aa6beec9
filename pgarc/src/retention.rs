//! Decides which base backups (and their dependent WAL) survive a
//! retention pass.
//!
//! Uses a mark-then-partition idiom: an ordered rule list computes a
//! keep/drop mark per backup in one pass, then the marks are partitioned.
//! Lock checks (`BackupLockInfo`) are consulted before any rule can mark a
//! backup for removal — pinned or actively-referenced backups always
//! survive, regardless of what the rules say.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{BackupRow, BackupStatus};
use crate::worker_registry::Registry;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("invalid regex pattern {pattern:?}: {source}")]
    InvalidPattern { pattern: String, #[source] source: regex::Error },
}

pub type Result<T> = std::result::Result<T, RetentionError>;

/// One rule of a named retention policy, loaded from `Config` and matched
/// against a `backup_list`-ordered (newest-first) set of backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RetentionRule {
    /// Backups whose label matches `pattern` are always kept.
    KeepWithLabel { pattern: String },
    /// Backups whose label matches `pattern` are marked for removal,
    /// unless a lock overrides the rule.
    DropWithLabel { pattern: String },
    /// The `count` newest backups (by `started`) are always kept.
    KeepNewest { count: usize },
    /// The `count` oldest backups are always kept.
    KeepOldest { count: usize },
    /// Backups whose `started` timestamp is older than `seconds` ago (as
    /// of the `now` passed to `apply_policy`) are marked for removal.
    DropOlderThan { seconds: i64 },
    /// Backups whose label matches `pattern` get their `pinned` flag set,
    /// applied directly against the catalog rather than the keep/drop
    /// partition.
    Pin { pattern: String },
    /// The inverse of `Pin`.
    Unpin { pattern: String },
}

/// Aggregates independent reasons a backup must not be removed, combined
/// with short-circuit OR: if any source reports a lock, the backup stays.
pub trait BackupLockInfo {
    fn is_locked(&self, backup: &BackupRow) -> bool;
}

/// Locks a backup that is pinned and not aborted.
pub struct BackupPinnedValidLockInfo;

impl BackupLockInfo for BackupPinnedValidLockInfo {
    fn is_locked(&self, backup: &BackupRow) -> bool {
        backup.pinned && backup.status != BackupStatus::Aborted
    }
}

/// Locks a backup currently referenced by a live copy-manager child slot
/// in the worker registry (an in-progress restore or verification reading
/// its files).
pub struct SHMBackupLockInfo<'a> {
    registry: &'a Registry,
}

impl<'a> SHMBackupLockInfo<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        SHMBackupLockInfo { registry }
    }
}

impl BackupLockInfo for SHMBackupLockInfo<'_> {
    fn is_locked(&self, backup: &BackupRow) -> bool {
        for i in 0..self.registry.num_workers() {
            let Ok(info) = self.registry.read(i) else { continue };
            if info.pid == 0 {
                continue;
            }
            for child in info.children {
                if child.child_pid != 0 && child.attached_backup_id == backup.id {
                    return true;
                }
            }
        }
        false
    }
}

/// Combines any number of `BackupLockInfo` sources with short-circuit OR.
pub fn any_locked(sources: &[&dyn BackupLockInfo], backup: &BackupRow) -> bool {
    sources.iter().any(|s| s.is_locked(backup))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mark {
    Keep,
    Drop,
    Undecided,
}

/// The outcome of one retention pass over one archive's backup list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupDecision {
    pub keep: Vec<i64>,
    pub drop: Vec<i64>,
}

/// Applies `rules` in order against `backups` (expected newest-first, the
/// order `Catalog::backup_list` returns), honoring every lock in `locks`.
/// Rules run first-match-wins per backup: once a rule decides a backup's
/// fate, later rules are skipped for it. Backups no rule decides default
/// to `Keep` (a retention policy only removes what it explicitly targets).
pub fn apply_policy(
    rules: &[RetentionRule],
    backups: &[BackupRow],
    now: i64,
    locks: &[&dyn BackupLockInfo],
) -> Result<CleanupDecision> {
    let mut marks = vec![Mark::Undecided; backups.len()];

    for rule in rules {
        match rule {
            RetentionRule::KeepWithLabel { pattern } => {
                let re = compile(pattern)?;
                for (i, b) in backups.iter().enumerate() {
                    if marks[i] == Mark::Undecided && re.is_match(&b.label) {
                        marks[i] = Mark::Keep;
                    }
                }
            }
            RetentionRule::DropWithLabel { pattern } => {
                let re = compile(pattern)?;
                for (i, b) in backups.iter().enumerate() {
                    if marks[i] == Mark::Undecided && re.is_match(&b.label) {
                        marks[i] = Mark::Drop;
                    }
                }
            }
            RetentionRule::KeepNewest { count } => {
                for i in 0..(*count).min(backups.len()) {
                    if marks[i] == Mark::Undecided {
                        marks[i] = Mark::Keep;
                    }
                }
            }
            RetentionRule::KeepOldest { count } => {
                let start = backups.len().saturating_sub(*count);
                for i in start..backups.len() {
                    if marks[i] == Mark::Undecided {
                        marks[i] = Mark::Keep;
                    }
                }
            }
            RetentionRule::DropOlderThan { seconds } => {
                for (i, b) in backups.iter().enumerate() {
                    if marks[i] == Mark::Undecided && now - b.started >= *seconds {
                        marks[i] = Mark::Drop;
                    }
                }
            }
            RetentionRule::Pin { .. } | RetentionRule::Unpin { .. } => {
                // Mutates the catalog's `pinned` column directly, via
                // `pinned_label_matches` below; it does not participate in
                // the keep/drop partition itself.
            }
        }
    }

    let mut decision = CleanupDecision::default();
    for (i, b) in backups.iter().enumerate() {
        let locked = any_locked(locks, b);
        let keep = locked || marks[i] != Mark::Drop;
        if keep {
            decision.keep.push(b.id);
        } else {
            decision.drop.push(b.id);
        }
    }
    debug!(kept = decision.keep.len(), dropped = decision.drop.len(), "retention pass decided");
    Ok(decision)
}

/// Returns the ids of backups a `Pin`/`Unpin` rule's label pattern
/// matches, for the caller to apply via `Catalog::set_pinned`.
pub fn pinned_label_matches(rule: &RetentionRule, backups: &[BackupRow]) -> Result<(Vec<i64>, bool)> {
    let (pattern, pin) = match rule {
        RetentionRule::Pin { pattern } => (pattern, true),
        RetentionRule::Unpin { pattern } => (pattern, false),
        _ => return Ok((Vec::new(), false)),
    };
    let re = compile(pattern)?;
    let ids = backups.iter().filter(|b| re.is_match(&b.label)).map(|b| b.id).collect();
    Ok((ids, pin))
}

/// Cleanup intervals: for each timeline still referenced by a kept
/// backup, WAL at or after that backup's `xlogpos` must be retained; WAL
/// for timelines with no surviving backup may be fully reclaimed.
pub fn wal_retention_floor(backups: &[BackupRow], decision: &CleanupDecision) -> std::collections::HashMap<u32, u64> {
    let keep: HashSet<i64> = decision.keep.iter().copied().collect();
    let mut floor: std::collections::HashMap<u32, u64> = std::collections::HashMap::new();
    for b in backups {
        if keep.contains(&b.id) {
            floor
                .entry(b.timeline)
                .and_modify(|pos| *pos = (*pos).min(b.xlogpos))
                .or_insert(b.xlogpos);
        }
    }
    floor
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| RetentionError::InvalidPattern { pattern: pattern.to_string(), source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn backup(id: i64, label: &str, started: i64, pinned: bool, timeline: u32, xlogpos: u64) -> BackupRow {
        BackupRow {
            id,
            archive_id: 1,
            xlogpos,
            xlogposend: Some(xlogpos + 1),
            timeline,
            label: label.to_string(),
            fsentry: Utf8PathBuf::from(format!("/archive/base/streambackup-{id}")),
            started,
            stopped: Some(started + 10),
            pinned,
            status: BackupStatus::Ready,
            systemid: 1,
            wal_segment_size: 16 * 1024 * 1024,
            used_profile: None,
            pg_version_num: 150000,
        }
    }

    #[test]
    fn scenario_s5_keep_newest_n_drops_the_rest() {
        let backups = vec![
            backup(3, "b3", 300, false, 1, 300),
            backup(2, "b2", 200, false, 1, 200),
            backup(1, "b1", 100, false, 1, 100),
        ];
        let rules = vec![RetentionRule::KeepNewest { count: 2 }, RetentionRule::DropOlderThan { seconds: 0 }];
        let decision = apply_policy(&rules, &backups, 1000, &[]).unwrap();
        assert_eq!(decision.keep, vec![3, 2]);
        assert_eq!(decision.drop, vec![1]);
    }

    #[test]
    fn scenario_s6_pinned_backup_survives_drop_older_than() {
        let backups = vec![backup(1, "b1", 0, true, 1, 100)];
        let rules = vec![RetentionRule::DropOlderThan { seconds: 1 }];
        let locks: Vec<&dyn BackupLockInfo> = vec![&BackupPinnedValidLockInfo];
        let decision = apply_policy(&rules, &backups, 1000, &locks).unwrap();
        assert_eq!(decision.keep, vec![1]);
        assert!(decision.drop.is_empty());
    }

    #[test]
    fn keep_with_label_regex_overrides_drop_older_than() {
        let backups = vec![
            backup(1, "nightly-2026-01-01", 0, false, 1, 0),
            backup(2, "weekly-2026-01-01", 0, false, 1, 0),
        ];
        let rules = vec![
            RetentionRule::KeepWithLabel { pattern: "^weekly-".into() },
            RetentionRule::DropOlderThan { seconds: 1 },
        ];
        let decision = apply_policy(&rules, &backups, 1000, &[]).unwrap();
        assert_eq!(decision.keep, vec![2]);
        assert_eq!(decision.drop, vec![1]);
    }

    #[test]
    fn applying_the_same_policy_twice_is_idempotent() {
        let backups = vec![backup(1, "b1", 0, false, 1, 0), backup(2, "b2", 100, false, 1, 0)];
        let rules = vec![RetentionRule::KeepNewest { count: 1 }];
        let first = apply_policy(&rules, &backups, 1000, &[]).unwrap();
        let second = apply_policy(&rules, &backups, 1000, &[]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_regex_pattern_is_rejected() {
        let backups = vec![backup(1, "b1", 0, false, 1, 0)];
        let rules = vec![RetentionRule::DropWithLabel { pattern: "(unterminated".into() }];
        let err = apply_policy(&rules, &backups, 1000, &[]).unwrap_err();
        assert!(matches!(err, RetentionError::InvalidPattern { .. }));
    }

    #[test]
    fn wal_retention_floor_tracks_the_oldest_kept_backup_per_timeline() {
        let backups = vec![backup(1, "b1", 0, false, 1, 1000), backup(2, "b2", 100, false, 1, 2000)];
        let decision = CleanupDecision { keep: vec![1, 2], drop: vec![] };
        let floor = wal_retention_floor(&backups, &decision);
        assert_eq!(floor.get(&1), Some(&1000));
    }

    #[test]
    fn pin_rule_reports_matching_ids_without_touching_the_partition() {
        let backups = vec![backup(1, "keep-me", 0, false, 1, 0), backup(2, "other", 0, false, 1, 0)];
        let rule = RetentionRule::Pin { pattern: "^keep-".into() };
        let (ids, pin) = pinned_label_matches(&rule, &backups).unwrap();
        assert_eq!(ids, vec![1]);
        assert!(pin);
    }
}
