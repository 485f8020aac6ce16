use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::Transport;

pub const DEFAULT_BY_PATH_DIR: &str = "/dev/disk/by-path";
pub const DEFAULT_INITIATOR_FILE: &str = "/etc/iscsi/initiatorname.iscsi";
pub const DEFAULT_FS_TYPE: &str = "ext4";

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    iscsi: IscsiCfg,
    #[serde(default)]
    volume: VolumeCfg,
    #[serde(default)]
    broker: BrokerCfg,
}

impl Config {
    /// create `Config` from yaml string
    pub fn from(s: &str) -> Result<Config> {
        let config = serde_yml::from_str::<Config>(s)?;
        Ok(config)
    }

    /// create `Config` from yaml file
    pub fn read<S: AsRef<Path>>(filename: S) -> Result<Config> {
        let s = fs::read_to_string(filename)?;
        Config::from(&s)
    }

    /// encodes `Config` to yaml string
    pub fn to_yml(&self) -> Result<String> {
        let s = serde_yml::to_string(self)?;
        Ok(s)
    }

    /// echo `Config` yaml string to the file
    pub fn write_to<S: AsRef<Path>>(&self, filename: S) -> Result<()> {
        let yml = self.to_yml()?;
        fs::write(filename, yml)?;

        Ok(())
    }

    pub fn iscsi(&self) -> &IscsiCfg {
        &self.iscsi
    }

    pub fn volume(&self) -> &VolumeCfg {
        &self.volume
    }

    pub fn broker(&self) -> &BrokerCfg {
        &self.broker
    }
}

/// Session establishment settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IscsiCfg {
    transport: Transport,
    retries: u32,
    interval_ms: u64,
    by_path_dir: String,
    initiator_file: String,
}

impl Default for IscsiCfg {
    fn default() -> Self {
        IscsiCfg {
            transport: Transport::Tcp,
            retries: 10,
            interval_ms: 1000,
            by_path_dir: DEFAULT_BY_PATH_DIR.to_string(),
            initiator_file: DEFAULT_INITIATOR_FILE.to_string(),
        }
    }
}

impl IscsiCfg {
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// attempts made while waiting for the device after login, never below one
    pub fn retries(&self) -> u32 {
        self.retries.max(1)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn by_path_dir(&self) -> &str {
        &self.by_path_dir
    }

    pub fn initiator_file(&self) -> &Path {
        Path::new(&self.initiator_file)
    }

    pub fn with_transport<T: Into<Transport>>(mut self, transport: T) -> Self {
        self.transport = transport.into();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_by_path_dir<S: AsRef<str>>(mut self, dir: S) -> Self {
        self.by_path_dir = dir.as_ref().to_string();
        self
    }

    pub fn with_initiator_file<S: AsRef<str>>(mut self, file: S) -> Self {
        self.initiator_file = file.as_ref().to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeCfg {
    default_fs_type: String,
}

impl Default for VolumeCfg {
    fn default() -> Self {
        VolumeCfg {
            default_fs_type: DEFAULT_FS_TYPE.to_string(),
        }
    }
}

impl VolumeCfg {
    pub fn default_fs_type(&self) -> &str {
        if self.default_fs_type.is_empty() {
            DEFAULT_FS_TYPE
        } else {
            &self.default_fs_type
        }
    }
}

/// Identity of the service advertised in the broker catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerCfg {
    service_name: String,
    service_id: String,
    service_description: String,
    image_prefix: String,
}

impl Default for BrokerCfg {
    fn default() -> Self {
        BrokerCfg {
            service_name: "opensds-service".to_string(),
            service_id: "4f6e6cf6-ffdd-425f-a2c7-3c9258ad2468".to_string(),
            service_description: "Policy based storage service".to_string(),
            image_prefix: "OPENSDS".to_string(),
        }
    }
}

impl BrokerCfg {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn service_description(&self) -> &str {
        &self.service_description
    }

    pub fn image_prefix(&self) -> &str {
        &self.image_prefix
    }
}
