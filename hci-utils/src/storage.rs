// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Health of Storage Spaces Direct virtual disks and the clustered storage
//! subsystem.

use serde::Deserialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Warning => "Warning",
            HealthStatus::Unhealthy => "Unhealthy",
            HealthStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// The operational status of a virtual disk.
///
/// Windows reports a list of statuses (e.g. `Degraded Incomplete`); we keep
/// the space-joined rendering and only ever ask whether it is exactly `OK`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct OperationalStatus(pub String);

impl OperationalStatus {
    pub fn is_ok(&self) -> bool {
        self.0.trim() == "OK"
    }
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualDisk {
    pub friendly_name: String,
    pub health_status: HealthStatus,
    pub operational_status: OperationalStatus,
}

impl VirtualDisk {
    pub fn is_healthy(&self) -> bool {
        self.health_status == HealthStatus::Healthy
            && self.operational_status.is_ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StorageSubsystem {
    pub friendly_name: String,
    pub health_status: HealthStatus,
}

impl StorageSubsystem {
    /// A subsystem in `Warning` is tolerated. `Unknown` is not: a status we
    /// cannot read is not evidence of health.
    pub fn is_unhealthy(&self) -> bool {
        matches!(
            self.health_status,
            HealthStatus::Unhealthy | HealthStatus::Unknown
        )
    }
}

/// A point-in-time snapshot of clustered storage health.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageHealth {
    pub subsystem: StorageSubsystem,
    pub virtual_disks: Vec<VirtualDisk>,
}

impl StorageHealth {
    pub fn unhealthy_disks(&self) -> impl Iterator<Item = &VirtualDisk> {
        self.virtual_disks.iter().filter(|disk| !disk.is_healthy())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_virtual_disks() {
        let json = r#"[
            {"FriendlyName":"Volume01","HealthStatus":"Healthy","OperationalStatus":"OK"},
            {"FriendlyName":"Volume02","HealthStatus":"Warning","OperationalStatus":"Degraded Incomplete"},
            {"FriendlyName":"Volume03","HealthStatus":"Healthy","OperationalStatus":"InService"}
        ]"#;
        let disks: Vec<VirtualDisk> = serde_json::from_str(json).unwrap();
        let healthy: Vec<_> = disks.iter().map(|d| d.is_healthy()).collect();
        assert_eq!(healthy, vec![true, false, false]);
        assert_eq!(disks[1].health_status, HealthStatus::Warning);
    }

    #[test]
    fn unrecognized_health_is_unknown() {
        let subsystem: StorageSubsystem = serde_json::from_str(
            r#"{"FriendlyName":"Clustered Windows Storage on c1","HealthStatus":"Mystery"}"#,
        )
        .unwrap();
        assert_eq!(subsystem.health_status, HealthStatus::Unknown);
        assert!(subsystem.is_unhealthy());
    }
}
