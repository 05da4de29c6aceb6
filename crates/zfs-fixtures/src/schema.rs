//! Fixture document model.
//!
//! Documents are YAML trees describing the disks of a test case. They are
//! decoded into loosely typed raw structs first and then converted into the
//! validated model below, so unknown type tags are rejected here rather than
//! while provisioning.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::{Error, Result};

/// Destination-relative path mapped to a payload identifier.
pub type ContentMap = BTreeMap<String, String>;

/// Dataset name that designates the pool's own root dataset.
pub const POOL_ROOT_DATASET: &str = ".";

/// Device name whose backing file gets scrambled once its pool is built.
pub const CORRUPTED_DEVICE_NAME: &str = "corrupted";

/// A whole fixture: every disk of a test case, in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureSpec {
    pub devices: Vec<Device>,
}

/// One synthetic disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Backing file names; more than one builds a mirror.
    pub names: Vec<String>,
    pub kind: DeviceKind,
}

/// What lives on a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceKind {
    /// A ZFS pool built on the device's backing files.
    StoragePool(PoolSpec),
    /// An ext4 filesystem populated with payload content.
    PlainFilesystem { content: ContentMap },
    /// A blank disk.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSpec {
    /// Logical pool name, namespaced with the run identifier at provisioning time.
    pub pool_name: String,
    /// Leave the pool imported after teardown; the audit then expects it.
    pub keep_imported: bool,
    pub datasets: Vec<DatasetSpec>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatasetSpec {
    /// Pool-relative name, or [`POOL_ROOT_DATASET`].
    pub name: String,
    pub keep_imported: bool,
    pub content: ContentMap,
    pub is_current_system_root: bool,
    pub bootfs: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub last_booted_kernel: Option<String>,
    pub mountpoint: Option<String>,
    pub canmount: CanMount,
    pub snapshots: Vec<SnapshotSpec>,
    pub fstab: Vec<FstabEntry>,
}

impl DatasetSpec {
    /// Whether this entry addresses the pool's root dataset.
    pub fn is_pool_root(&self) -> bool {
        self.name == POOL_ROOT_DATASET
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SnapshotSpec {
    pub name: String,
    pub content: ContentMap,
    pub fstab: Vec<FstabEntry>,
    pub creation_date: Option<DateTime<Utc>>,
    pub last_booted_kernel: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FstabEntry {
    /// Logical identifier: a pool-relative dataset or a device name.
    pub filesystem: String,
    pub mountpoint: String,
    pub kind: FstabType,
}

/// Filesystem type of an fstab line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FstabType {
    StoragePool,
    PlainFilesystem,
}

impl FstabType {
    /// Tag written in the third fstab column.
    pub fn as_str(&self) -> &'static str {
        match self {
            FstabType::StoragePool => "zfs",
            FstabType::PlainFilesystem => "ext4",
        }
    }
}

impl std::str::FromStr for FstabType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "zfs" => Ok(FstabType::StoragePool),
            "ext4" => Ok(FstabType::PlainFilesystem),
            other => Err(Error::InvalidFstabType(other.to_string())),
        }
    }
}

/// The `canmount` dataset property as written in fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanMount {
    /// Leave the property untouched.
    #[default]
    Unset,
    On,
    NoAuto,
    Off,
}

impl CanMount {
    /// Whether the dataset gets mounted while provisioning.
    pub fn should_mount(&self) -> bool {
        matches!(self, CanMount::On | CanMount::NoAuto)
    }

    /// Property value to set, if any.
    pub fn property_value(&self) -> Option<&'static str> {
        match self {
            CanMount::Unset => None,
            CanMount::On => Some("on"),
            CanMount::NoAuto => Some("noauto"),
            CanMount::Off => Some("off"),
        }
    }
}

impl std::str::FromStr for CanMount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(CanMount::Unset),
            "on" => Ok(CanMount::On),
            "noauto" => Ok(CanMount::NoAuto),
            "off" => Ok(CanMount::Off),
            other => Err(Error::malformed(format!("unknown canmount value: {}", other))),
        }
    }
}

/// Parse a fixture document.
pub fn parse(document: &str) -> Result<FixtureSpec> {
    let raw: RawFixture = serde_yaml::from_str(document)
        .map_err(|e| Error::malformed(format!("couldn't decode device list: {}", e)))?;
    FixtureSpec::try_from(raw)
}

/// Read and parse a fixture document from disk.
pub fn load(path: &Path) -> Result<FixtureSpec> {
    let document = std::fs::read_to_string(path).map_err(|e| {
        Error::malformed(format!("couldn't read fixture definition {}: {}", path.display(), e))
    })?;
    parse(&document)
}

impl FixtureSpec {
    /// Storage pool specs in document order, paired with their device.
    pub fn pools(&self) -> impl Iterator<Item = (&Device, &PoolSpec)> {
        self.devices.iter().filter_map(|device| match &device.kind {
            DeviceKind::StoragePool(pool) => Some((device, pool)),
            _ => None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawFixture {
    #[serde(default)]
    devices: Vec<RawDevice>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: ContentMap,
    #[serde(default)]
    zfs: RawPool,
}

#[derive(Debug, Default, Deserialize)]
struct RawPool {
    #[serde(default)]
    pool_name: String,
    #[serde(default)]
    keep_imported: bool,
    #[serde(default)]
    datasets: Vec<RawDataset>,
}

#[derive(Debug, Deserialize)]
struct RawDataset {
    name: String,
    #[serde(default)]
    keep_imported: bool,
    #[serde(default)]
    content: ContentMap,
    #[serde(default)]
    is_current_system_root: bool,
    #[serde(default)]
    zsys_bootfs: bool,
    #[serde(default)]
    last_used: Option<String>,
    #[serde(default)]
    last_booted_kernel: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    canmount: Option<String>,
    #[serde(default)]
    snapshots: Vec<RawSnapshot>,
    #[serde(default)]
    fstab: Vec<RawFstabEntry>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    name: String,
    #[serde(default)]
    content: ContentMap,
    #[serde(default)]
    fstab: Vec<RawFstabEntry>,
    #[serde(default)]
    creation_date: Option<String>,
    #[serde(default)]
    last_booted_kernel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFstabEntry {
    filesystem: String,
    mountpoint: String,
    #[serde(rename = "type")]
    kind: String,
}

impl TryFrom<RawFixture> for FixtureSpec {
    type Error = Error;

    fn try_from(raw: RawFixture) -> Result<Self> {
        let devices = raw
            .devices
            .into_iter()
            .map(Device::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { devices })
    }
}

impl TryFrom<RawDevice> for Device {
    type Error = Error;

    fn try_from(raw: RawDevice) -> Result<Self> {
        if raw.names.is_empty() || raw.names.iter().any(|n| n.trim().is_empty()) {
            return Err(Error::malformed("every device needs at least one non-empty name"));
        }

        let tag = raw.kind.unwrap_or_default().to_lowercase();
        let kind = match tag.as_str() {
            "zfs" => DeviceKind::StoragePool(PoolSpec::try_from(raw.zfs)?),
            "ext4" => {
                if raw.names.len() > 1 {
                    return Err(Error::malformed(format!(
                        "only one device allowed for ext4, got {:?}",
                        raw.names
                    )));
                }
                DeviceKind::PlainFilesystem {
                    content: raw.content,
                }
            }
            "" => DeviceKind::Empty,
            other => return Err(Error::malformed(format!("unknown device type: {}", other))),
        };

        Ok(Self {
            names: raw.names,
            kind,
        })
    }
}

impl TryFrom<RawPool> for PoolSpec {
    type Error = Error;

    fn try_from(raw: RawPool) -> Result<Self> {
        if raw.pool_name.trim().is_empty() {
            return Err(Error::malformed("zfs device without pool_name"));
        }
        let datasets = raw
            .datasets
            .into_iter()
            .map(DatasetSpec::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            pool_name: raw.pool_name,
            keep_imported: raw.keep_imported,
            datasets,
        })
    }
}

impl TryFrom<RawDataset> for DatasetSpec {
    type Error = Error;

    fn try_from(raw: RawDataset) -> Result<Self> {
        let canmount = raw.canmount.as_deref().unwrap_or_default().parse()?;
        let snapshots = raw
            .snapshots
            .into_iter()
            .map(SnapshotSpec::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            last_used: parse_timestamp_field("last_used", raw.last_used.as_deref())?,
            name: raw.name,
            keep_imported: raw.keep_imported,
            content: raw.content,
            is_current_system_root: raw.is_current_system_root,
            bootfs: raw.zsys_bootfs,
            last_booted_kernel: non_empty(raw.last_booted_kernel),
            mountpoint: non_empty(raw.mountpoint),
            canmount,
            snapshots,
            fstab: convert_fstab(raw.fstab)?,
        })
    }
}

impl TryFrom<RawSnapshot> for SnapshotSpec {
    type Error = Error;

    fn try_from(raw: RawSnapshot) -> Result<Self> {
        Ok(Self {
            creation_date: parse_timestamp_field("creation_date", raw.creation_date.as_deref())?,
            name: raw.name,
            content: raw.content,
            fstab: convert_fstab(raw.fstab)?,
            last_booted_kernel: non_empty(raw.last_booted_kernel),
        })
    }
}

fn convert_fstab(entries: Vec<RawFstabEntry>) -> Result<Vec<FstabEntry>> {
    entries
        .into_iter()
        .map(|raw| {
            Ok(FstabEntry {
                kind: raw.kind.parse()?,
                filesystem: raw.filesystem,
                mountpoint: raw.mountpoint,
            })
        })
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_timestamp_field(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse_timestamp(text)
            .map(Some)
            .ok_or_else(|| Error::malformed(format!("couldn't parse {} timestamp {:?}", field, text))),
    }
}

/// Parse an RFC 3339 timestamp, also accepting the space separated form YAML allows.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S %z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
