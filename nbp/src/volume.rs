use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::VolumeCfg;
use crate::exec::{Executor, HostExecutor};

/// Formats and mounts attached block devices.
pub struct Mounter<E = HostExecutor> {
    exec: E,
    default_fs_type: String,
}

impl Mounter<HostExecutor> {
    pub fn host(cfg: &VolumeCfg) -> Self {
        Mounter::new(HostExecutor::new(), cfg)
    }
}

impl<E: Executor> Mounter<E> {
    pub fn new(exec: E, cfg: &VolumeCfg) -> Self {
        Mounter {
            exec,
            default_fs_type: cfg.default_fs_type().to_string(),
        }
    }

    /// Filesystem type reported by `blkid`, or `None` when the device carries
    /// no signature or the probe fails.
    pub fn fs_type(&self, device: &str) -> Option<String> {
        match self.exec.run("blkid", &[device]) {
            Ok(out) => parse_fs_type(&out),
            Err(e) => {
                warn!("failed to probe filesystem of {}: {}", device, e);
                None
            }
        }
    }

    /// Creates a filesystem unless one is already present. An empty `fs_type`
    /// selects the configured default.
    pub fn format(&self, device: &str, fs_type: &str) -> Result<()> {
        if let Some(current) = self.fs_type(device) {
            info!("device {} is already formatted as {}", device, current);
            return Ok(());
        }

        let fs_type = if fs_type.is_empty() {
            self.default_fs_type.as_str()
        } else {
            fs_type
        };
        info!("Format device: {} fstype: {}", device, fs_type);
        self.exec
            .run("mkfs", &["-t", fs_type, "-F", device])
            .with_context(|| format!("format {} as {}", device, fs_type))?;

        Ok(())
    }

    /// Mounts `device` at `mount_point`, creating the directory first. A failed
    /// mkdir is only logged; the mount itself then decides.
    pub fn mount(&self, device: &str, mount_point: &str) -> Result<()> {
        info!("Mount device: {} mountpoint: {}", device, mount_point);
        if let Err(e) = self.exec.run("mkdir", &["-p", mount_point]) {
            warn!("failed to create mount point {}: {}", mount_point, e);
        }

        self.exec
            .run("mount", &[device, mount_point])
            .with_context(|| format!("mount {} on {}", device, mount_point))?;

        Ok(())
    }

    pub fn format_and_mount(&self, device: &str, fs_type: &str, mount_point: &str) -> Result<()> {
        self.format(device, fs_type)?;
        self.mount(device, mount_point)
    }

    pub fn umount(&self, mount_point: &str) -> Result<()> {
        info!("Umount mountpoint: {}", mount_point);
        self.exec
            .run("umount", &[mount_point])
            .with_context(|| format!("umount {}", mount_point))?;

        Ok(())
    }
}

/// Signature reported by a `blkid` line. A filesystem `TYPE` wins; a bare
/// partition table (`PTTYPE`) still counts so the disk is never reformatted.
pub fn parse_fs_type(output: &str) -> Option<String> {
    let mut fs_type = None;
    let mut pt_type = None;
    for field in output.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"');
        if value.is_empty() {
            continue;
        }
        match key {
            "TYPE" => fs_type = Some(value.to_string()),
            "PTTYPE" => pt_type = Some(value.to_string()),
            _ => {}
        }
    }
    fs_type.or(pt_type)
}
