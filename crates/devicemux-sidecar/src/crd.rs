//! The `MobileDevice` custom resource.
//!
//! Each attached device is represented by one namespaced `MobileDevice`,
//! named after its UDID and owned by the sidecar pod that sees it. Its
//! status carries the `Paired`, `DeveloperDiskMounted` and `Ready`
//! conditions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use devicemux_core::Udid;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the `MobileDevice` resource.
pub const GROUP: &str = "devicemux.io";

/// Label naming the sidecar pod that manages a resource.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label naming the operating system of a device.
pub const OS_LABEL: &str = "kubernetes.io/os";

/// Value of [`OS_LABEL`] for every managed device.
pub const OS_VALUE: &str = "ios";

/// Label carrying the device UDID with its original casing.
pub const UDID_LABEL: &str = "devicemux.io/udid";

/// Desired state of a mobile device.
#[derive(CustomResource, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "devicemux.io",
    version = "v1alpha1",
    kind = "MobileDevice",
    namespaced,
    status = "MobileDeviceStatus",
    shortname = "md",
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner"}"#
)]
pub struct MobileDeviceSpec {
    /// Name of the sidecar pod the device is attached to.
    pub owner: String,
}

/// Observed state of a mobile device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MobileDeviceStatus {
    /// Current conditions, one per type.
    #[serde(default)]
    pub conditions: Vec<DeviceCondition>,
}

/// Kind of a device condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    /// The host holds a pairing record the device trusts.
    Paired,
    /// A developer disk image is mounted on the device.
    DeveloperDiskMounted,
    /// The device is paired and has a developer disk mounted.
    Ready,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Paired => "Paired",
            Self::DeveloperDiskMounted => "DeveloperDiskMounted",
            Self::Ready => "Ready",
        };
        f.write_str(s)
    }
}

/// Status of a device condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// A single status condition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCondition {
    /// Condition kind.
    #[serde(rename = "type")]
    pub type_: ConditionType,
    /// Whether the condition holds.
    pub status: ConditionStatus,
    /// Machine-readable reason for the current status.
    pub reason: String,
    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time the condition was evaluated.
    pub last_heartbeat_time: DateTime<Utc>,
    /// Last time `status` changed.
    pub last_transition_time: DateTime<Utc>,
}

/// Label selector for the devices managed by a sidecar pod.
#[must_use]
pub fn managed_selector(pod_name: &str) -> String {
    format!("{MANAGED_BY_LABEL}={pod_name},{OS_LABEL}={OS_VALUE}")
}

/// Labels applied to every object the sidecar creates for a device.
#[must_use]
pub fn device_labels(udid: &Udid, pod_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), pod_name.to_string());
    labels.insert(OS_LABEL.to_string(), OS_VALUE.to_string());
    labels.insert(UDID_LABEL.to_string(), udid.to_string());
    labels
}

/// Build the resource for a newly seen device.
#[must_use]
pub fn build_mobile_device(
    udid: &Udid,
    pod_name: &str,
    owner: OwnerReference,
) -> MobileDevice {
    MobileDevice {
        metadata: ObjectMeta {
            name: Some(udid.resource_name()),
            labels: Some(device_labels(udid, pod_name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: MobileDeviceSpec {
            owner: pod_name.to_string(),
        },
        status: Some(MobileDeviceStatus::default()),
    }
}

/// Return the UDID a resource represents.
///
/// Falls back to the resource name when the UDID label is missing.
#[must_use]
pub fn device_udid(device: &MobileDevice) -> Option<Udid> {
    device
        .labels()
        .get(UDID_LABEL)
        .and_then(|v| Udid::new(v.as_str()).ok())
        .or_else(|| Udid::new(device.name_any()).ok())
}
