//! Partition Descriptors and Registry
//!
//! A partition descriptor is immutable metadata about one time-range
//! partition; the registry is the authoritative ordered set of them,
//! guarded by a reader-writer lock. Descriptors are ordered latest
//! first (`end` descending, then `start` descending) and no two share a
//! start time.
//!
//! "Lookup then maybe create" goes through `find_or_create`, which
//! holds an upgradable read lock, atomically upgrades, and re-checks
//! before creating.

use crate::timeutil;
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("partition start collision unresolvable: start {start} reaches end {end}")]
    CollisionUnresolvable {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("index duration is not representable")]
    BadDuration,
}

/// Immutable metadata about one partition. `is_new` flips to false once
/// the on-disk directory has been materialized.
#[derive(Debug)]
pub struct Partition {
    pub id: u64,
    pub path: PathBuf,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    is_new: AtomicBool,
}

impl Partition {
    /// Whether `[start, end)` covers the reference time.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    /// Whether the partition has aged out at `now` under `retention`.
    pub fn expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        self.end + retention < now
    }

    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::Acquire)
    }

    pub fn mark_opened(&self) {
        self.is_new.store(false, Ordering::Release);
    }
}

/// The ordered descriptor collection. All mutation happens through the
/// registry's lock.
pub struct PartitionSet {
    root: PathBuf,
    id_seed: u64,
    partitions: Vec<Arc<Partition>>,
}

impl PartitionSet {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            id_seed: 0,
            partitions: Vec::new(),
        }
    }

    fn sort(&mut self) {
        self.partitions
            .sort_by(|a, b| b.end.cmp(&a.end).then_with(|| b.start.cmp(&a.start)));
    }

    pub fn all(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    /// The unique partition containing `t`, if any.
    pub fn find_for(&self, t: DateTime<Utc>) -> Option<Arc<Partition>> {
        self.partitions.iter().find(|p| p.contains(t)).cloned()
    }

    /// Partitions intersecting `[start, end]`; a missing bound is open.
    pub fn select_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<Arc<Partition>> {
        self.partitions
            .iter()
            .filter(|p| {
                if let Some(e) = end {
                    if e < p.start {
                        return false;
                    }
                }
                if let Some(s) = start {
                    if s > p.end {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Mint a descriptor for `[start, end)`. Two descriptors may not
    /// share a start time (their paths would collide), so a colliding
    /// start advances to the blocking partition's end until the
    /// collision clears; reaching `end` is an error.
    pub fn create(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Arc<Partition>, PartitionError> {
        let mut start = start;
        while let Some(existing) = self.partitions.iter().find(|p| p.start == start) {
            start = existing.end;
            if start >= end {
                return Err(PartitionError::CollisionUnresolvable { start, end });
            }
        }

        self.id_seed += 1;
        let partition = Arc::new(Partition {
            id: self.id_seed,
            path: self.root.join(timeutil::format_partition_time(start)),
            start,
            end,
            is_new: AtomicBool::new(true),
        });
        tracing::info!(
            "partition {} created, start {}, end {}",
            partition.path.display(),
            partition.start,
            partition.end
        );
        self.partitions.push(Arc::clone(&partition));
        self.sort();
        Ok(partition)
    }
}

/// The descriptor registry.
pub struct PartitionRegistry {
    set: RwLock<PartitionSet>,
}

impl PartitionRegistry {
    /// Create `root` when missing and enumerate its partition
    /// directories. A directory with a missing or unparsable name or
    /// `end-time` file is logged and skipped.
    pub fn open(root: &Path) -> Result<Self, PartitionError> {
        std::fs::create_dir_all(root)?;
        let mut set = PartitionSet::new(root.to_path_buf());

        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }

            let Some(start) = timeutil::parse_partition_time(&name) else {
                tracing::warn!("skipping {}: not a partition directory name", name);
                continue;
            };
            let end_path = entry.path().join(crate::store::END_TIME_FILE);
            let end = match std::fs::read_to_string(&end_path) {
                Ok(content) => match content
                    .lines()
                    .next()
                    .and_then(timeutil::parse_partition_time)
                {
                    Some(end) => end,
                    None => {
                        tracing::warn!("skipping {}: unparsable end-time file", name);
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!("skipping {}: cannot read end-time file: {}", name, e);
                    continue;
                }
            };

            set.id_seed += 1;
            set.partitions.push(Arc::new(Partition {
                id: set.id_seed,
                path: entry.path(),
                start,
                end,
                is_new: AtomicBool::new(false),
            }));
            tracing::info!("opened partition at {}", entry.path().display());
        }
        set.sort();
        Ok(Self { set: RwLock::new(set) })
    }

    pub fn find_for(&self, t: DateTime<Utc>) -> Option<Arc<Partition>> {
        self.set.read().find_for(t)
    }

    pub fn select_range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<Arc<Partition>> {
        self.set.read().select_range(start, end)
    }

    pub fn snapshot(&self) -> Vec<Arc<Partition>> {
        self.set.read().all().to_vec()
    }

    /// Find the partition covering `t`, creating one aligned to
    /// `duration` when none exists. The read lock is upgraded
    /// atomically and the lookup re-checked before creation.
    pub fn find_or_create(
        &self,
        t: DateTime<Utc>,
        duration: std::time::Duration,
    ) -> Result<Arc<Partition>, PartitionError> {
        let guard = self.set.upgradable_read();
        if let Some(p) = guard.find_for(t) {
            return Ok(p);
        }

        let mut set = RwLockUpgradableReadGuard::upgrade(guard);
        if let Some(p) = set.find_for(t) {
            return Ok(p);
        }
        let start = timeutil::align_time(t, duration);
        let span = chrono::Duration::from_std(duration)
            .map_err(|_| PartitionError::BadDuration)?;
        set.create(start, start + span)
    }

    /// Remove descriptors matching `pred` and delete their directories.
    /// Returns the removed descriptors.
    pub fn retire<F>(&self, pred: F) -> Vec<Arc<Partition>>
    where
        F: Fn(&Partition) -> bool,
    {
        let mut set = self.set.write();
        let partitions = std::mem::take(&mut set.partitions);
        let (removed, kept): (Vec<_>, Vec<_>) = partitions.into_iter().partition(|p| pred(p));
        set.partitions = kept;

        for p in &removed {
            if !p.path.exists() {
                continue;
            }
            match std::fs::remove_dir_all(&p.path) {
                Ok(()) => tracing::info!("deleted partition {}", p.path.display()),
                Err(e) => {
                    tracing::warn!("failed to delete partition {}: {}", p.path.display(), e)
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn utc(s: &str) -> DateTime<Utc> {
        timeutil::parse_time(s).unwrap()
    }

    const HOUR: Duration = Duration::from_secs(3600);

    fn assert_invariants(registry: &PartitionRegistry) {
        let parts = registry.snapshot();
        for pair in parts.windows(2) {
            let ord = pair[0]
                .end
                .cmp(&pair[1].end)
                .then(pair[0].start.cmp(&pair[1].start));
            assert_ne!(ord, std::cmp::Ordering::Less, "registry must be latest-first");
            assert_ne!(pair[0].start, pair[1].start, "starts must be unique");
        }
    }

    #[test]
    fn test_find_or_create_aligns_to_duration() {
        let dir = tempdir().unwrap();
        let registry = PartitionRegistry::open(dir.path()).unwrap();

        let p = registry
            .find_or_create(utc("2023-01-02T03:04:05Z"), HOUR)
            .unwrap();
        assert_eq!(p.start, utc("2023-01-02T03:00:00Z"));
        assert_eq!(p.end, utc("2023-01-02T04:00:00Z"));
        assert!(p.is_new());

        // Second call finds the same descriptor.
        let q = registry
            .find_or_create(utc("2023-01-02T03:59:59Z"), HOUR)
            .unwrap();
        assert_eq!(q.id, p.id);
        assert_invariants(&registry);
    }

    #[test]
    fn test_end_is_exclusive() {
        let dir = tempdir().unwrap();
        let registry = PartitionRegistry::open(dir.path()).unwrap();
        let p = registry
            .find_or_create(utc("2023-01-02T03:30:00Z"), HOUR)
            .unwrap();

        // An event exactly at end falls into the next partition.
        assert!(!p.contains(p.end));
        let q = registry.find_or_create(p.end, HOUR).unwrap();
        assert_ne!(q.id, p.id);
        assert_eq!(q.start, p.end);
        assert_invariants(&registry);
    }

    #[test]
    fn test_select_range() {
        let dir = tempdir().unwrap();
        let registry = PartitionRegistry::open(dir.path()).unwrap();
        registry.find_or_create(utc("2023-01-02T03:30:00Z"), HOUR).unwrap();
        registry.find_or_create(utc("2023-01-02T04:30:00Z"), HOUR).unwrap();
        registry.find_or_create(utc("2023-01-02T05:30:00Z"), HOUR).unwrap();

        // Open on both sides: everything.
        assert_eq!(registry.select_range(None, None).len(), 3);

        let within = registry.select_range(
            Some(utc("2023-01-02T04:10:00Z")),
            Some(utc("2023-01-02T04:20:00Z")),
        );
        assert_eq!(within.len(), 1);
        assert_eq!(within[0].start, utc("2023-01-02T04:00:00Z"));

        let upper = registry.select_range(Some(utc("2023-01-02T05:00:00Z")), None);
        assert_eq!(upper.len(), 2);

        let none = registry.select_range(Some(utc("2023-01-03T00:00:00Z")), None);
        assert!(none.is_empty());
    }

    #[test]
    fn test_create_collision_advances_start() {
        let dir = tempdir().unwrap();
        let registry = PartitionRegistry::open(dir.path()).unwrap();
        registry.find_or_create(utc("2023-01-02T03:30:00Z"), HOUR).unwrap();

        let mut set = registry.set.write();
        // Same start, wider end: start advances to the existing end.
        let p = set
            .create(utc("2023-01-02T03:00:00Z"), utc("2023-01-02T05:00:00Z"))
            .unwrap();
        assert_eq!(p.start, utc("2023-01-02T04:00:00Z"));

        // Same start, same end: nothing left after advancing.
        let err = set
            .create(utc("2023-01-02T03:00:00Z"), utc("2023-01-02T04:00:00Z"))
            .unwrap_err();
        assert!(matches!(err, PartitionError::CollisionUnresolvable { .. }));
    }

    #[test]
    fn test_open_enumerates_and_skips_corrupt() {
        let dir = tempdir().unwrap();

        // A valid partition directory.
        let good = dir.path().join("2023-01-02T03-00-00");
        std::fs::create_dir_all(&good).unwrap();
        std::fs::write(
            good.join(crate::store::END_TIME_FILE),
            "2023-01-02T04-00-00\n",
        )
        .unwrap();

        // Missing end-time file.
        std::fs::create_dir_all(dir.path().join("2023-01-02T05-00-00")).unwrap();
        // Not a partition name.
        std::fs::create_dir_all(dir.path().join("lost+found")).unwrap();
        // Hidden directory.
        std::fs::create_dir_all(dir.path().join(".trash")).unwrap();

        let registry = PartitionRegistry::open(dir.path()).unwrap();
        let parts = registry.snapshot();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].start, utc("2023-01-02T03:00:00Z"));
        assert_eq!(parts[0].end, utc("2023-01-02T04:00:00Z"));
        assert!(!parts[0].is_new());
    }

    #[test]
    fn test_retire_removes_and_deletes() {
        let dir = tempdir().unwrap();
        let registry = PartitionRegistry::open(dir.path()).unwrap();
        let p = registry
            .find_or_create(utc("2023-01-02T03:30:00Z"), HOUR)
            .unwrap();
        std::fs::create_dir_all(&p.path).unwrap();
        registry.find_or_create(utc("2023-01-02T05:30:00Z"), HOUR).unwrap();

        let removed = registry.retire(|part| part.id == p.id);
        assert_eq!(removed.len(), 1);
        assert!(!p.path.exists());
        assert_eq!(registry.snapshot().len(), 1);
    }
}
