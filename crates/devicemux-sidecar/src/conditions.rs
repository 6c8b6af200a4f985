//! Status condition bookkeeping.

use chrono::{DateTime, Utc};

use crate::crd::{ConditionStatus, ConditionType, DeviceCondition, MobileDeviceStatus};

/// Reason for `Paired=True`.
pub const REASON_PAIRED: &str = "Paired";
/// Reason for `Paired=False`.
pub const REASON_NOT_TRUSTED: &str = "NotTrusted";
/// Reason for `DeveloperDiskMounted=True`.
pub const REASON_MOUNTED: &str = "Mounted";
/// Reason for `DeveloperDiskMounted=False` when no image matches the device.
pub const REASON_NO_DEVELOPER_DISK: &str = "NoDeveloperDisk";
/// Reason for `DeveloperDiskMounted=False` when the device is not paired.
pub const REASON_NOT_PAIRED: &str = "NotPaired";
/// Reason for `DeveloperDiskMounted=False` when the device refused the image.
pub const REASON_MOUNT_FAILED: &str = "MountFailed";
/// Reason for `Ready=False` on a resource that was just created.
pub const REASON_NEW: &str = "New";
/// Reason for `Ready=True`.
pub const REASON_DEVICE_READY: &str = "DeviceReady";
/// Reason for `Ready=False` once the device has been seen before.
pub const REASON_NOT_READY: &str = "NotReady";

impl MobileDeviceStatus {
    /// Find a condition by type.
    #[must_use]
    pub fn condition(&self, type_: ConditionType) -> Option<&DeviceCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Check whether a condition is present and true.
    #[must_use]
    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Set a condition, appending it if absent.
    ///
    /// The heartbeat is always refreshed; the transition time only moves
    /// when the status changes.
    pub fn set_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: &str,
        message: Option<String>,
        now: DateTime<Utc>,
    ) {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
            existing.last_heartbeat_time = now;
        } else {
            self.conditions.push(DeviceCondition {
                type_,
                status,
                reason: reason.to_string(),
                message,
                last_heartbeat_time: now,
                last_transition_time: now,
            });
        }
    }

    /// Recompute `Ready` from `Paired` and `DeveloperDiskMounted`.
    ///
    /// A device that is not ready keeps its current `False` reason, so a
    /// freshly created resource stays `New` until it first becomes ready.
    pub fn update_ready(&mut self, now: DateTime<Utc>) {
        if self.is_true(ConditionType::Paired) && self.is_true(ConditionType::DeveloperDiskMounted)
        {
            self.set_condition(
                ConditionType::Ready,
                ConditionStatus::True,
                REASON_DEVICE_READY,
                None,
                now,
            );
            return;
        }

        let reason = match self.condition(ConditionType::Ready) {
            Some(c) if c.status == ConditionStatus::False => c.reason.clone(),
            _ => REASON_NOT_READY.to_string(),
        };
        self.set_condition(
            ConditionType::Ready,
            ConditionStatus::False,
            &reason,
            None,
            now,
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        let t2 = t0 + Duration::seconds(20);
        let mut status = MobileDeviceStatus::default();

        status.set_condition(ConditionType::Paired, ConditionStatus::False, REASON_NOT_TRUSTED, None, t0);
        status.set_condition(ConditionType::Paired, ConditionStatus::False, REASON_NOT_TRUSTED, None, t1);
        let paired = status.condition(ConditionType::Paired).unwrap();
        assert_eq!(paired.last_transition_time, t0);
        assert_eq!(paired.last_heartbeat_time, t1);

        status.set_condition(ConditionType::Paired, ConditionStatus::True, REASON_PAIRED, None, t2);
        let paired = status.condition(ConditionType::Paired).unwrap();
        assert_eq!(paired.last_transition_time, t2);
        assert_eq!(paired.reason, REASON_PAIRED);
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn ready_keeps_new_until_first_ready() {
        let now = Utc::now();
        let mut status = MobileDeviceStatus::default();
        status.set_condition(ConditionType::Ready, ConditionStatus::False, REASON_NEW, None, now);
        status.set_condition(ConditionType::Paired, ConditionStatus::True, REASON_PAIRED, None, now);
        status.set_condition(
            ConditionType::DeveloperDiskMounted,
            ConditionStatus::False,
            REASON_NO_DEVELOPER_DISK,
            None,
            now,
        );

        status.update_ready(now);
        assert_eq!(status.condition(ConditionType::Ready).unwrap().reason, REASON_NEW);

        status.set_condition(
            ConditionType::DeveloperDiskMounted,
            ConditionStatus::True,
            REASON_MOUNTED,
            None,
            now,
        );
        status.update_ready(now);
        assert!(status.is_true(ConditionType::Ready));

        status.set_condition(ConditionType::Paired, ConditionStatus::False, REASON_NOT_TRUSTED, None, now);
        status.update_ready(now);
        let ready = status.condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, REASON_NOT_READY);
    }

    #[test]
    fn ready_without_prior_condition_is_not_ready() {
        let mut status = MobileDeviceStatus::default();
        status.update_ready(Utc::now());
        assert_eq!(status.condition(ConditionType::Ready).unwrap().reason, REASON_NOT_READY);
    }
}
