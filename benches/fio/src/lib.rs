use std::collections::BTreeMap;

use common::{
    config::{FioSettings, TestSettings},
    device::{DISK_BUS_USB, DISK_TYPE, discover_devices},
    exec::{ExecError, Executor},
};
use eyre::{Context, ContextCompat, Result};
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};


pub use result::FioResult;

pub const FIO_TOOL: &str = "fio";

/// One fully resolved fio invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub filename: String,
    pub numjobs: u32,
    pub bs: String,
    pub iodepth: u32,
    pub rw: String,
    pub runtime: u64,
    pub verify: bool,
    pub direct: bool,
    pub ioengine: String,
}

impl WorkItem {
    /// Deterministic job name derived from the parameter tuple.
    pub fn job_name(&self) -> String {
        format!(
            "{}-{}-{}jobs-{}depth",
            self.rw, self.bs, self.numjobs, self.iodepth
        )
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--name".to_owned(),
            self.job_name(),
            "--filename".to_owned(),
            self.filename.clone(),
            "--numjobs".to_owned(),
            self.numjobs.to_string(),
            "--time_based".to_owned(),
            "--ioengine".to_owned(),
            self.ioengine.clone(),
            "--bs".to_owned(),
            self.bs.clone(),
            "--rw".to_owned(),
            self.rw.clone(),
            "--direct".to_owned(),
            u8::from(self.direct).to_string(),
            "--group_reporting".to_owned(),
            "--iodepth".to_owned(),
            self.iodepth.to_string(),
            "--runtime".to_owned(),
            format!("{}s", self.runtime),
            "--output-format".to_owned(),
            "json".to_owned(),
        ];
        if !self.verify {
            args.push("--verify".to_owned());
            args.push("0".to_owned());
        }
        args
    }
}

/// The full benchmark matrix, keyed by target. No key ever maps to an empty
/// item list, and the BTreeMap keeps dispatch order stable across runs.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkQueue {
    pub queue: BTreeMap<String, Vec<WorkItem>>,
}

impl WorkQueue {
    /// Expand the settings into per-target work lists. Explicit filenames are
    /// taken verbatim; with `use_all_disks` and no explicit targets, every
    /// empty non-root non-usb disk without children is selected.
    pub async fn build(settings: &TestSettings, executor: &dyn Executor) -> Result<Self> {
        let fio_settings = settings
            .fio_settings
            .as_ref()
            .context("fio parameters should be specified")?;
        let mut queue = BTreeMap::new();
        for filename in &fio_settings.filename {
            let items = expand(fio_settings, filename);
            if !items.is_empty() {
                queue.insert(filename.clone(), items);
            }
        }
        if !queue.is_empty() || !settings.use_all_disks {
            return Ok(Self { queue });
        }

        let devices = discover_devices(executor).await?;
        for device in devices.values() {
            if device.device_type != DISK_TYPE || device.bus == DISK_BUS_USB || device.is_root {
                continue;
            }
            if !device.empty || device.has_children {
                info!("skipping non-empty device {}", device.real_path);
                continue;
            }
            info!("selected device {}", device.real_path);
            let items = expand(fio_settings, &device.real_path);
            if !items.is_empty() {
                queue.insert(device.real_path.clone(), items);
            }
        }
        Ok(Self { queue })
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

fn expand(settings: &FioSettings, filename: &str) -> Vec<WorkItem> {
    iproduct!(
        &settings.numjobs,
        &settings.bs,
        &settings.iodepth,
        &settings.rw
    )
    .map(|(&numjobs, bs, &iodepth, rw)| WorkItem {
        filename: filename.to_owned(),
        numjobs,
        bs: bs.clone(),
        iodepth,
        rw: rw.clone(),
        runtime: settings.runtime,
        verify: settings.verify,
        direct: settings.direct,
        ioengine: settings.ioengine.clone(),
    })
    .collect()
}

/// Probe the installed fio version. A failure here means fio is missing and
/// no work should be scheduled.
pub async fn version(executor: &dyn Executor) -> Result<String> {
    executor
        .command_with_output(FIO_TOOL, &["--version"])
        .await
        .context("fio does not seem to be installed")
}

/// Drop page cache, dentries and inodes so each invocation starts cold.
pub async fn drop_caches(executor: &dyn Executor) -> Result<(), ExecError> {
    executor
        .command("sh", &["-c", "echo 3 > /proc/sys/vm/drop_caches"])
        .await
}

/// Run a single fio invocation and decode its JSON report. A dry run only
/// logs the command line and produces no result.
pub async fn run_test(
    executor: &dyn Executor,
    item: &WorkItem,
    dryrun: bool,
) -> Result<Option<FioResult>> {
    let args = item.args();
    if dryrun {
        info!("running command: {FIO_TOOL} {}", args.join(" "));
        return Ok(None);
    }
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = executor.command_with_output(FIO_TOOL, &args).await?;
    let result = serde_json::from_str(&output)
        .with_context(|| format!("failed to decode fio output for {}", item.job_name()))?;
    Ok(Some(result))
}

/// Run one target's items strictly in order. Item failures are logged and the
/// unit moves on; whatever results were produced are returned.
pub async fn run_unit(executor: &dyn Executor, items: &[WorkItem], dryrun: bool) -> Vec<FioResult> {
    let mut results = Vec::new();
    for item in items {
        if !dryrun {
            if let Err(err) = drop_caches(executor).await {
                warn!("failed to drop caches: {err}");
            }
        }
        match run_test(executor, item, dryrun).await {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(err) => warn!("fio test {} failed: {err}", item.job_name()),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::exec::MockExecutor;

    use super::*;

    fn settings(filenames: &[&str], use_all_disks: bool) -> TestSettings {
        TestSettings {
            fio_settings: Some(FioSettings {
                numjobs: vec![1, 4],
                bs: vec!["4K".to_owned(), "1M".to_owned()],
                iodepth: vec![1, 32],
                rw: vec!["read".to_owned(), "randwrite".to_owned()],
                runtime: 60,
                direct: true,
                filename: filenames.iter().map(|s| (*s).to_owned()).collect(),
                ..Default::default()
            }),
            use_all_disks,
            workers: 2,
            delay_secs: 0,
        }
    }

    fn unused_executor() -> MockExecutor {
        MockExecutor::new(Arc::new(|program: &str, _: &[&str]| {
            Err(ExecError::Failed {
                program: program.to_owned(),
                code: 1,
                stderr: "not scripted".to_owned(),
            })
        }))
    }

    const FIO_JSON: &str = r#"{"jobs": [{"jobname": "j", "read": {"iops_mean": 1.0, "bw_mean": 2.0, "lat_ns": {"min": 0, "max": 0, "mean": 0, "stddev": 0}}, "write": {"iops_mean": 3.0, "bw_mean": 4.0, "lat_ns": {"min": 0, "max": 0, "mean": 0, "stddev": 0}}}]}"#;

    #[tokio::test]
    async fn explicit_targets_expand_to_the_full_cross_product() {
        let queue = WorkQueue::build(&settings(&["/dev/vdb", "/dev/vdc"], false), &unused_executor())
            .await
            .unwrap();
        assert_eq!(queue.len(), 2);
        for items in queue.queue.values() {
            assert_eq!(items.len(), 2 * 2 * 2 * 2);
        }
        let first = &queue.queue["/dev/vdb"][0];
        assert_eq!(
            (first.numjobs, first.bs.as_str(), first.iodepth, first.rw.as_str()),
            (1, "4K", 1, "read")
        );
        // rw is the innermost dimension
        assert_eq!(queue.queue["/dev/vdb"][1].rw, "randwrite");
    }

    #[tokio::test]
    async fn expansion_is_idempotent() {
        let settings = settings(&["/dev/vdb"], false);
        let first = WorkQueue::build(&settings, &unused_executor()).await.unwrap();
        let second = WorkQueue::build(&settings, &unused_executor()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_dimension_produces_no_queue_entries() {
        let mut settings = settings(&["/dev/vdb"], false);
        settings.fio_settings.as_mut().unwrap().bs.clear();
        let queue = WorkQueue::build(&settings, &unused_executor()).await.unwrap();
        assert!(queue.is_empty());
        assert!(!queue.queue.values().any(Vec::is_empty));
    }

    const LSBLK_DISKS: &str = r#"SIZE="107374182400" ROTA="1" RO="0" TYPE="disk" PKNAME="" NAME="/dev/vda" KNAME="/dev/vda" UUID="" WWN="" MOUNTPOINT="/"
SIZE="53687091200" ROTA="0" RO="0" TYPE="disk" PKNAME="" NAME="/dev/vdb" KNAME="/dev/vdb" UUID="" WWN="" MOUNTPOINT=""
SIZE="53687091200" ROTA="0" RO="0" TYPE="disk" PKNAME="" NAME="/dev/vdc" KNAME="/dev/vdc" UUID="" WWN="" MOUNTPOINT="""#;

    #[tokio::test]
    async fn auto_discovery_skips_root_and_usb_disks() {
        let executor =
            MockExecutor::new(Arc::new(|program: &str, args: &[&str]| match (program, args) {
            ("lsblk", ["--all", ..]) => Ok(LSBLK_DISKS.to_owned()),
            ("udevadm", [_, _, "/dev/vdc"]) => Ok("ID_BUS=usb".to_owned()),
            _ => Err(ExecError::Failed {
                program: program.to_owned(),
                code: 1,
                stderr: "not scripted".to_owned(),
            }),
        }));
        let queue = WorkQueue::build(&settings(&[], true), &executor).await.unwrap();
        assert_eq!(queue.queue.keys().collect::<Vec<_>>(), ["/dev/vdb"]);
        assert_eq!(queue.queue["/dev/vdb"].len(), 16);
    }

    #[test]
    fn argument_vector_matches_the_fio_command_line() {
        let item = WorkItem {
            filename: "/dev/vdb".to_owned(),
            numjobs: 8,
            bs: "4K".to_owned(),
            iodepth: 1,
            rw: "randwrite".to_owned(),
            runtime: 100,
            verify: false,
            direct: true,
            ioengine: "libaio".to_owned(),
        };
        let args = item.args();
        assert_eq!(
            args,
            [
                "--name",
                "randwrite-4K-8jobs-1depth",
                "--filename",
                "/dev/vdb",
                "--numjobs",
                "8",
                "--time_based",
                "--ioengine",
                "libaio",
                "--bs",
                "4K",
                "--rw",
                "randwrite",
                "--direct",
                "1",
                "--group_reporting",
                "--iodepth",
                "1",
                "--runtime",
                "100s",
                "--output-format",
                "json",
                "--verify",
                "0"
            ]
        );

        let mut verified = item;
        verified.verify = true;
        verified.direct = false;
        let args = verified.args();
        assert!(!args.contains(&"--verify".to_owned()));
        assert_eq!(args[14], "0");
    }

    #[tokio::test]
    async fn unit_run_continues_past_failed_items() {
        let executor = MockExecutor::new(Arc::new(|program: &str, args: &[&str]| match program {
            "sh" => Ok(String::new()),
            FIO_TOOL if args.contains(&"4K") => Err(ExecError::Failed {
                program: program.to_owned(),
                code: 1,
                stderr: "io error".to_owned(),
            }),
            FIO_TOOL => Ok(FIO_JSON.to_owned()),
            _ => unreachable!(),
        }));
        let settings = settings(&["/dev/vdb"], false);
        let queue = WorkQueue::build(&settings, &unused_executor()).await.unwrap();
        let results = run_unit(&executor, &queue.queue["/dev/vdb"], false).await;
        // half of the 16 items use bs=4K and fail
        assert_eq!(results.len(), 8);
        assert_eq!(results[0].jobs[0].read.iops_mean, 1.0);
    }

    #[tokio::test]
    async fn dry_run_spawns_no_commands() {
        use std::sync::atomic::Ordering;

        let executor = unused_executor();
        let settings = settings(&["/dev/vdb"], false);
        let queue = WorkQueue::build(&settings, &executor).await.unwrap();
        let results = run_unit(&executor, &queue.queue["/dev/vdb"], true).await;
        assert!(results.is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn version_probe_fails_when_fio_is_missing() {
        assert!(version(&unused_executor()).await.is_err());
        let executor =
            MockExecutor::new(Arc::new(|_: &str, _: &[&str]| Ok("fio-3.27".to_owned())));
        assert_eq!(version(&executor).await.unwrap(), "fio-3.27");
    }
}
