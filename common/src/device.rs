use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use eyre::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::exec::{ExecError, Executor};

pub const DISK_TYPE: &str = "disk";
pub const SSD_TYPE: &str = "ssd";
pub const PART_TYPE: &str = "part";
pub const CRYPT_TYPE: &str = "crypt";
pub const LVM_TYPE: &str = "lvm";
pub const MPATH_TYPE: &str = "mpath";
pub const LINEAR_TYPE: &str = "linear";

pub const DISK_BUS_USB: &str = "usb";

pub const SYSTEM_ROOT_PATH: &str = "/";
pub const SYSTEM_ROOTFS_PATH: &str = "/rootfs";
/// When set to "true", a mount on /rootfs also marks the backing device as
/// the system root (the host root bind-mounted into a container).
pub const IN_CONTAINER_ENV: &str = "FIO_BENCHMARK_IN_CONTAINER";

/// Network block devices (rbd mappings) never become benchmark targets.
const RBD_PATTERN: &str = "^(?:/dev/)?rbd[0-9]+p?[0-9]{0,}$";

/// Storage-medium classification derived from the rotational flag and the
/// device path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Hdd,
    Ssd,
    Nvme,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub size: u64,
    pub label: String,
    pub filesystem: String,
}

/// One node of the discovered device graph.
///
/// `parents` is a set rather than a single reference: a logical volume that
/// spans several physical extents shows up in the lsblk listing once per
/// extent, each record naming a different PKNAME, and those records collapse
/// into one device here.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    pub kernel_name: String,
    pub real_path: String,
    pub parents: BTreeSet<String>,
    pub size: u64,
    pub uuid: String,
    pub serial: String,
    pub bus: String,
    pub device_type: String,
    pub rotational: bool,
    pub read_only: bool,
    pub partitions: Vec<Partition>,
    pub filesystem: String,
    pub vendor: String,
    pub model: String,
    pub path_id: String,
    pub wwn: String,
    pub wwn_vendor_extension: String,
    pub dev_links: String,
    pub has_children: bool,
    pub is_root: bool,
    pub mount_point: String,
    pub empty: bool,
    pub device_class: Option<DeviceClass>,
}

pub fn supported_device_type(device_type: &str) -> bool {
    matches!(
        device_type,
        DISK_TYPE | SSD_TYPE | CRYPT_TYPE | LVM_TYPE | MPATH_TYPE | PART_TYPE | LINEAR_TYPE
    )
}

/// A device is eligible for automatic selection only when nothing sits on it:
/// no parents, no partitions, no filesystem signature.
pub fn device_empty(device: &BlockDevice) -> bool {
    device.parents.is_empty()
        && supported_device_type(&device.device_type)
        && device.partitions.is_empty()
        && device.filesystem.is_empty()
}

pub fn disk_device_class(device: &BlockDevice) -> DeviceClass {
    if device.rotational {
        DeviceClass::Hdd
    } else if device.real_path.contains("nvme") {
        DeviceClass::Nvme
    } else {
        DeviceClass::Ssd
    }
}

fn in_container() -> bool {
    std::env::var(IN_CONTAINER_ENV).is_ok_and(|v| v == "true")
}

/// Discover all block devices on the local node.
///
/// The initial lsblk listing is the only fatal call; every supplemental
/// per-device query degrades that device's fields on failure and the pass
/// continues.
pub async fn discover_devices(executor: &dyn Executor) -> Result<BTreeMap<String, BlockDevice>> {
    let output = executor
        .command_with_output(
            "lsblk",
            &[
                "--all",
                "--bytes",
                "--pairs",
                "--paths",
                "--output",
                "SIZE,ROTA,RO,TYPE,PKNAME,NAME,KNAME,UUID,WWN,MOUNTPOINT",
            ],
        )
        .await
        .context("failed to list block devices")?;
    let rbd = Regex::new(RBD_PATTERN)?;

    // Group raw records by name. A name seen more than once keeps the scalar
    // properties of the last record but accumulates every parent reference.
    let mut records: BTreeMap<String, (HashMap<String, String>, BTreeSet<String>)> =
        BTreeMap::new();
    for line in output.lines() {
        let props = parse_key_value_pairs(line);
        let Some(name) = props.get("NAME").cloned() else {
            continue;
        };
        let record = records.entry(name).or_default();
        if let Some(parent) = props.get("PKNAME") {
            if !parent.is_empty() {
                record.1.insert(parent.clone());
            }
        }
        record.0 = props;
    }

    let mut devices = BTreeMap::new();
    for (name, (props, parents)) in records {
        if rbd.is_match(&name) {
            warn!("skipping rbd device {name:?}");
            continue;
        }
        let mut device = match populate_device_info(&props, parents) {
            Ok(device) => device,
            Err(err) => {
                warn!("skipping device {name:?}: {err}");
                continue;
            }
        };
        if let Err(err) = populate_udev_info(executor, &name, &mut device).await {
            // go on without udev info, the device just loses its optional
            // descriptive fields
            warn!("failed to get udev info for device {name:?}: {err}");
        }
        if device.device_type == DISK_TYPE {
            match list_device_children(executor, &name).await {
                // lsblk prints the device itself plus one line per child
                Ok(children) => device.has_children = children.len() > 1,
                Err(err) => {
                    warn!("failed to detect child devices for {name:?}, assuming none: {err}")
                }
            }
            match device_partitions(executor, &name).await {
                Ok(partitions) => device.partitions = partitions,
                Err(err) => {
                    warn!("failed to detect partitions for {name:?}, assuming none: {err}")
                }
            }
            device.device_class = Some(disk_device_class(&device));
        }
        device.empty = device_empty(&device);
        devices.insert(name, device);
    }

    propagate_root(&mut devices);
    for device in devices.values() {
        debug!("discovered {device:?}");
    }
    Ok(devices)
}

fn populate_device_info(
    props: &HashMap<String, String>,
    parents: BTreeSet<String>,
) -> Result<BlockDevice> {
    if props.is_empty() {
        bail!("device properties are empty");
    }
    let Some(device_type) = props.get("TYPE") else {
        bail!("device type is empty");
    };
    if !supported_device_type(device_type) {
        bail!("unsupported device type {device_type}");
    }

    let mut device = BlockDevice {
        device_type: device_type.clone(),
        parents,
        ..Default::default()
    };
    if let Some(name) = props.get("NAME") {
        device.name = name.clone();
        device.real_path = name.clone();
    }
    if let Some(val) = props.get("KNAME") {
        device.kernel_name = val.clone();
    }
    if let Some(val) = props.get("UUID") {
        device.uuid = val.clone();
    }
    if let Some(val) = props.get("WWN") {
        device.wwn = val.clone();
    }
    if let Some(val) = props.get("MOUNTPOINT") {
        device.mount_point = val.clone();
        if val == SYSTEM_ROOT_PATH || (in_container() && val == SYSTEM_ROOTFS_PATH) {
            device.is_root = true;
        }
    }
    if let Some(val) = props.get("SIZE") {
        if let Ok(size) = val.parse() {
            device.size = size;
        }
    }
    if let Some(val) = props.get("ROTA") {
        device.rotational = matches!(val.as_str(), "1" | "true");
    }
    if let Some(val) = props.get("RO") {
        device.read_only = matches!(val.as_str(), "1" | "true");
    }
    Ok(device)
}

async fn populate_udev_info(
    executor: &dyn Executor,
    device: &str,
    disk: &mut BlockDevice,
) -> Result<(), ExecError> {
    let info = udev_info(executor, device).await?;
    if let Some(val) = info.get("DEVLINKS") {
        disk.dev_links = val.clone();
    }
    if let Some(val) = info.get("ID_FS_TYPE") {
        disk.filesystem = val.clone();
    }
    if let Some(val) = info.get("ID_SERIAL") {
        disk.serial = val.clone();
    }
    if let Some(val) = info.get("ID_BUS") {
        disk.bus = val.clone();
    }
    if let Some(val) = info.get("ID_VENDOR") {
        disk.vendor = val.clone();
    }
    if let Some(val) = info.get("ID_MODEL") {
        disk.model = val.clone();
    }
    if let Some(val) = info.get("ID_WWN_WITH_EXTENSION") {
        disk.wwn_vendor_extension = val.clone();
    }
    if let Some(val) = info.get("ID_WWN") {
        disk.wwn = val.clone();
    }
    if let Some(val) = info.get("ID_PATH") {
        disk.path_id = val.clone();
    }
    Ok(())
}

/// Root-ancestry propagation: every transitive parent of a root-backing
/// device is root-backing too. Worklist with a visited set, iterated to a
/// fixed point; the parent relation is a DAG but parent edges can be
/// duplicated and devices are discovered in arbitrary order.
fn propagate_root(devices: &mut BTreeMap<String, BlockDevice>) {
    let mut pending: VecDeque<String> = devices
        .values()
        .filter(|d| d.is_root)
        .map(|d| d.name.clone())
        .collect();
    let mut visited: HashSet<String> = HashSet::new();
    while let Some(name) = pending.pop_front() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let Some(parents) = devices.get(&name).map(|d| d.parents.clone()) else {
            continue;
        };
        for parent in parents {
            if let Some(device) = devices.get_mut(&parent) {
                device.is_root = true;
            }
            pending.push_back(parent);
        }
    }
}

/// Bare device names are resolved under /dev; full paths are used verbatim.
fn device_path(device: &str) -> String {
    if device.contains('/') {
        device.to_owned()
    } else {
        format!("/dev/{device}")
    }
}

pub async fn udev_info(
    executor: &dyn Executor,
    device: &str,
) -> Result<HashMap<String, String>, ExecError> {
    let path = device_path(device);
    let output = executor
        .command_with_output("udevadm", &["info", "--query=property", &path])
        .await?;
    Ok(parse_udev_output(&output))
}

/// List a device and all of its children, one path per line.
pub async fn list_device_children(
    executor: &dyn Executor,
    device: &str,
) -> Result<Vec<String>, ExecError> {
    let path = device_path(device);
    let output = executor
        .command_with_output(
            "lsblk",
            &["--noheadings", "--path", "--list", "--output", "NAME", &path],
        )
        .await?;
    Ok(output.lines().map(str::to_owned).collect())
}

/// Enumerate the partitions sitting on a device, each augmented best-effort
/// with its own udev metadata for label and filesystem.
pub async fn device_partitions(executor: &dyn Executor, device: &str) -> Result<Vec<Partition>> {
    let path = device_path(device);
    let output = executor
        .command_with_output(
            "lsblk",
            &[
                &path, "--bytes", "--paths", "--pairs", "--output", "NAME,SIZE,TYPE,PKNAME",
            ],
        )
        .await
        .with_context(|| format!("failed to get device {device} partitions"))?;

    let mut partitions = Vec::new();
    for line in output.lines() {
        let props = parse_key_value_pairs(line);
        let Some(name) = props.get("NAME") else {
            continue;
        };
        if props.get("PKNAME").map(String::as_str) != Some(device)
            || props.get("TYPE").map(String::as_str) != Some(PART_TYPE)
        {
            continue;
        }
        let mut partition = Partition {
            name: name.clone(),
            ..Default::default()
        };
        if let Some(size) = props.get("SIZE") {
            partition.size = size
                .parse()
                .with_context(|| format!("failed to get partition {name} size"))?;
        }
        match udev_info(executor, name).await {
            Ok(info) => {
                if let Some(val) = info.get("PARTNAME") {
                    partition.label = val.clone();
                }
                if let Some(val) = info.get("ID_PART_ENTRY_NAME") {
                    partition.label = val.clone();
                }
                if let Some(val) = info.get("ID_FS_TYPE") {
                    partition.filesystem = val.clone();
                }
            }
            Err(err) => warn!("failed to get udev info for partition {name:?}: {err}"),
        }
        partitions.push(partition);
    }
    Ok(partitions)
}

/// Parse one lsblk --pairs line, `SIZE="512" TYPE="disk" ...`, into a map.
fn parse_key_value_pairs(raw: &str) -> HashMap<String, String> {
    raw.split(' ')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_owned(), value.replace('"', "")))
        .collect()
}

/// Parse line-delimited `KEY=value` udevadm output into a map.
fn parse_udev_output(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}
