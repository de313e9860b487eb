//! Queue registry and submission dispatch.
//!
//! Every [`QueueRecord`] carries the roles (graphics, compute, transfer, ...)
//! assigned to its family. [`QueueContainer::submit`] picks a queue for a role
//! with a per-role round-robin cursor, preferring [`QueueLevel::Dedicated`]
//! queues over the shared default queue of a family.

use crate::error::{GpuError, Result};
use crate::raw::{RawDevice, Submission};
use crate::sync::Fence;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a queue is the default queue other work also lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLevel {
    /// Queue 0 of a family that serves several roles.
    Shared,
    /// Any other queue.
    Dedicated,
}

impl QueueLevel {
    /// Level of queue `queue_index` in a family assigned `roles`.
    pub fn classify(roles: vk::QueueFlags, queue_index: u32) -> Self {
        if queue_index == 0 && roles.as_raw().count_ones() > 1 {
            Self::Shared
        } else {
            Self::Dedicated
        }
    }
}

/// A hardware queue and the roles it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRecord {
    pub flags: vk::QueueFlags,
    pub family_index: u32,
    pub queue_index: u32,
    pub queue: vk::Queue,
    pub level: QueueLevel,
}

/// Queue family chosen for each role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilyRoles {
    pub graphics: Option<u32>,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyRoles {
    /// Pick one family per role from the advertised family capabilities.
    ///
    /// Dedicated compute and transfer families are preferred. Compute falls
    /// back to the graphics family and transfer to the compute family, since
    /// graphics and compute families implicitly accept transfer work.
    pub fn assign(families: &[vk::QueueFlags]) -> Self {
        let mut graphics = None;
        let mut compute = None;
        let mut transfer = None;

        for (i, &flags) in families.iter().enumerate() {
            let i = i as u32;

            // Look for dedicated compute queue (no graphics)
            if flags.contains(vk::QueueFlags::COMPUTE)
                && !flags.contains(vk::QueueFlags::GRAPHICS)
                && compute.is_none()
            {
                compute = Some(i);
            }

            // Look for dedicated transfer queue (no graphics or compute)
            if flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && transfer.is_none()
            {
                transfer = Some(i);
            }

            if flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
                graphics = Some(i);
            }
        }

        let compute = compute.or(graphics);
        let transfer = transfer.or(compute);

        Self {
            graphics,
            compute,
            transfer,
        }
    }

    /// Roles served by `family`.
    pub fn roles_of(&self, family: u32) -> vk::QueueFlags {
        [
            (self.graphics, vk::QueueFlags::GRAPHICS),
            (self.compute, vk::QueueFlags::COMPUTE),
            (self.transfer, vk::QueueFlags::TRANSFER),
        ]
        .into_iter()
        .filter(|(assigned, _)| *assigned == Some(family))
        .fold(vk::QueueFlags::empty(), |acc, (_, role)| acc | role)
    }

    /// Distinct families that serve at least one role, ascending.
    pub fn families(&self) -> Vec<u32> {
        let mut families: Vec<u32> = [self.graphics, self.compute, self.transfer]
            .into_iter()
            .flatten()
            .collect();
        families.sort_unstable();
        families.dedup();
        families
    }

    /// Build the queue records for `queue_count(family)` queues in every used family.
    pub fn records(
        &self,
        queue_count: impl Fn(u32) -> u32,
        mut queue: impl FnMut(u32, u32) -> vk::Queue,
    ) -> Vec<QueueRecord> {
        let mut records = Vec::new();
        for family in self.families() {
            let roles = self.roles_of(family);
            for index in 0..queue_count(family) {
                records.push(QueueRecord {
                    flags: roles,
                    family_index: family,
                    queue_index: index,
                    queue: queue(family, index),
                    level: QueueLevel::classify(roles, index),
                });
            }
        }
        records
    }
}

struct QueueEntry {
    record: QueueRecord,
    // Native queues need external synchronization for submits.
    submit_lock: Mutex<()>,
}

/// The set of queues of a device, grouped by capability.
pub struct QueueContainer {
    raw: Arc<dyn RawDevice>,
    entries: Vec<QueueEntry>,
    cursors: HashMap<vk::QueueFlags, Mutex<usize>>,
}

impl QueueContainer {
    /// Register `records` in order. One cursor is created per capability bit present.
    pub fn new(raw: Arc<dyn RawDevice>, records: Vec<QueueRecord>) -> Self {
        let mut cursors = HashMap::new();
        for record in &records {
            let bits = record.flags.as_raw();
            for bit in (0..u32::BITS).map(|i| 1u32 << i).filter(|b| bits & b != 0) {
                cursors
                    .entry(vk::QueueFlags::from_raw(bit))
                    .or_insert_with(|| Mutex::new(0));
            }
        }

        Self {
            raw,
            entries: records
                .into_iter()
                .map(|record| QueueEntry {
                    record,
                    submit_lock: Mutex::new(()),
                })
                .collect(),
            cursors,
        }
    }

    /// All registered queues, in registration order.
    pub fn records(&self) -> impl Iterator<Item = &QueueRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Whether any queue supports `flag`.
    pub fn supports(&self, flag: vk::QueueFlags) -> bool {
        self.records().any(|r| r.flags.contains(flag))
    }

    /// Family of the first queue supporting `flag`.
    pub fn family_for(&self, flag: vk::QueueFlags) -> Option<u32> {
        self.records()
            .find(|r| r.flags.contains(flag))
            .map(|r| r.family_index)
    }

    /// Pick the next queue for `flag` and advance its cursor.
    ///
    /// # Panics
    /// If `flag` is not exactly one capability bit.
    pub fn select(&self, flag: vk::QueueFlags) -> Result<QueueRecord> {
        self.select_entry(flag).map(|entry| entry.record)
    }

    /// Submit `submissions` to a queue supporting `flag`, signaling `fence` on completion.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(
        &self,
        flag: vk::QueueFlags,
        submissions: &[Submission],
        fence: Option<&Fence>,
    ) -> Result<()> {
        let entry = self.select_entry(flag)?;
        let fence = fence.map_or(vk::Fence::null(), Fence::handle);

        let _guard = entry.submit_lock.lock();
        // SAFETY: the per-queue lock is held for the duration of the submit.
        unsafe {
            self.raw
                .queue_submit(entry.record.queue, submissions, fence)
        }
    }

    fn select_entry(&self, flag: vk::QueueFlags) -> Result<&QueueEntry> {
        assert!(
            flag.as_raw().is_power_of_two(),
            "queue capability must be a single flag, got {flag:?}"
        );

        let candidates: Vec<&QueueEntry> = self
            .entries
            .iter()
            .filter(|e| e.record.flags.contains(flag))
            .collect();
        let cursor = self.cursors.get(&flag);
        let (Some(cursor), false) = (cursor, candidates.is_empty()) else {
            return Err(GpuError::NoQueueSupportsFlag(flag));
        };

        let mut cursor = cursor.lock();
        let start = *cursor % candidates.len();
        let position = (0..candidates.len())
            .map(|step| (start + step) % candidates.len())
            .find(|&i| candidates[i].record.level == QueueLevel::Dedicated)
            .unwrap_or(start);
        *cursor = (position + 1) % candidates.len();

        let entry = candidates[position];
        tracing::trace!(
            ?flag,
            family = entry.record.family_index,
            queue = entry.record.queue_index,
            "selected queue"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessConfig, HeadlessDevice, QueueFamilyConfig};
    use ash::vk::Handle;

    fn record(flags: vk::QueueFlags, family: u32, index: u32, raw: u64) -> QueueRecord {
        QueueRecord {
            flags,
            family_index: family,
            queue_index: index,
            queue: vk::Queue::from_raw(raw),
            level: QueueLevel::classify(flags, index),
        }
    }

    fn container(records: Vec<QueueRecord>) -> (Arc<HeadlessDevice>, QueueContainer) {
        let device = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let queues = QueueContainer::new(device.clone(), records);
        (device, queues)
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let roles = QueueFamilyRoles::assign(&[
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::TRANSFER,
        ]);
        assert_eq!(
            roles,
            QueueFamilyRoles {
                graphics: Some(0),
                compute: Some(1),
                transfer: Some(2),
            }
        );
        assert_eq!(roles.families(), vec![0, 1, 2]);
    }

    #[test]
    fn roles_fall_back_to_graphics() {
        let roles = QueueFamilyRoles::assign(&[
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        ]);
        assert_eq!(roles.compute, Some(0));
        assert_eq!(roles.transfer, Some(0));
        assert_eq!(
            roles.roles_of(0),
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER
        );

        let records = roles.records(|_| 2, |f, i| vk::Queue::from_raw(u64::from(f * 10 + i + 1)));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, QueueLevel::Shared);
        assert_eq!(records[1].level, QueueLevel::Dedicated);
    }

    #[test]
    fn level_classification() {
        let all = vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER;
        assert_eq!(QueueLevel::classify(all, 0), QueueLevel::Shared);
        assert_eq!(QueueLevel::classify(all, 1), QueueLevel::Dedicated);
        assert_eq!(
            QueueLevel::classify(vk::QueueFlags::TRANSFER, 0),
            QueueLevel::Dedicated
        );
    }

    #[test]
    fn round_robin_between_two_queues() {
        let transfer = vk::QueueFlags::TRANSFER;
        let (device, queues) = container(vec![
            record(vk::QueueFlags::GRAPHICS, 0, 0, 100),
            record(transfer, 1, 0, 200),
            record(transfer, 1, 1, 201),
        ]);

        for _ in 0..4 {
            queues.submit(transfer, &[], None).unwrap();
        }

        let visited: Vec<u64> = device
            .submissions()
            .iter()
            .map(|s| s.queue.as_raw())
            .collect();
        assert_eq!(visited, vec![200, 201, 200, 201]);
    }

    #[test]
    fn dedicated_queues_are_preferred_over_shared() {
        let roles = vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER;
        let (_, queues) = container(vec![
            record(roles, 0, 0, 10),
            record(roles, 0, 1, 11),
            record(roles, 0, 2, 12),
        ]);

        let picks: Vec<u32> = (0..4)
            .map(|_| queues.select(vk::QueueFlags::TRANSFER).unwrap().queue_index)
            .collect();
        assert_eq!(picks, vec![1, 2, 1, 2]);
    }

    #[test]
    fn single_shared_queue_is_still_used() {
        let roles = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let (_, queues) = container(vec![record(roles, 0, 0, 10)]);
        assert_eq!(
            queues.select(vk::QueueFlags::COMPUTE).unwrap().level,
            QueueLevel::Shared
        );
        assert_eq!(queues.select(vk::QueueFlags::COMPUTE).unwrap().queue_index, 0);
    }

    #[test]
    fn missing_capability_is_an_error() {
        let (_, queues) = container(vec![record(vk::QueueFlags::GRAPHICS, 0, 0, 10)]);
        assert!(!queues.supports(vk::QueueFlags::TRANSFER));
        let err = queues.submit(vk::QueueFlags::TRANSFER, &[], None).unwrap_err();
        assert!(matches!(err, GpuError::NoQueueSupportsFlag(f) if f == vk::QueueFlags::TRANSFER));
    }

    #[test]
    fn concurrent_submissions_are_balanced() {
        let device = Arc::new(HeadlessDevice::new(HeadlessConfig {
            queue_families: vec![QueueFamilyConfig {
                flags: vk::QueueFlags::TRANSFER,
                queue_count: 2,
            }],
            ..HeadlessConfig::default()
        }));
        let queues = QueueContainer::new(device.clone(), device.queue_records());

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..25 {
                        queues.submit(vk::QueueFlags::TRANSFER, &[], None).unwrap();
                    }
                });
            }
        });

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 100);
        let first = submissions[0].queue;
        let on_first = submissions.iter().filter(|s| s.queue == first).count();
        assert_eq!(on_first, 50);
    }

    #[test]
    #[should_panic(expected = "single flag")]
    fn combined_flags_are_rejected() {
        let (_, queues) = container(vec![record(vk::QueueFlags::GRAPHICS, 0, 0, 10)]);
        let _ = queues.select(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
    }
}
