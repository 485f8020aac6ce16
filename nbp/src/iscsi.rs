//! iSCSI session management.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::IscsiCfg;
use crate::exec::{Executor, HostExecutor};
use crate::probe::{wait_for_path, DeviceProbe, HostProbe, Transport};
use crate::NbpError;

static ISCSIADM: &str = "iscsiadm";
static INITIATOR_KEY: &str = "InitiatorName=";

/// Target connection parameters as handed over by the control plane.
///
/// Absent keys decode to their zero value.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub access_mode: String,
    #[serde(rename = "authUserName")]
    pub auth_user: String,
    pub auth_password: String,
    pub auth_method: String,
    pub target_discovered: bool,
    pub target_iqn: String,
    pub target_portal: String,
    pub target_lun: u32,
    pub volume_id: String,
    pub encrypted: bool,
}

impl ConnectionDescriptor {
    pub fn new<S: AsRef<str>>(portal: S, iqn: S, lun: u32) -> Self {
        ConnectionDescriptor {
            target_portal: portal.as_ref().to_string(),
            target_iqn: iqn.as_ref().to_string(),
            target_lun: lun,
            ..Default::default()
        }
    }

    /// decodes the connection data map returned with a volume attachment
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let desc = serde_json::from_value::<ConnectionDescriptor>(value)?;
        Ok(desc)
    }

    pub fn with_chap<S: AsRef<str>>(mut self, method: S, user: S, password: S) -> Self {
        self.auth_method = method.as_ref().to_string();
        self.auth_user = user.as_ref().to_string();
        self.auth_password = password.as_ref().to_string();
        self
    }

    pub fn has_auth(&self) -> bool {
        !self.auth_method.is_empty()
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("access_mode", &self.access_mode)
            .field("auth_method", &self.auth_method)
            .field("auth_user", &self.auth_user)
            .field("target_discovered", &self.target_discovered)
            .field("target_iqn", &self.target_iqn)
            .field("target_portal", &self.target_portal)
            .field("target_lun", &self.target_lun)
            .field("volume_id", &self.volume_id)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

pub struct SessionManager<E = HostExecutor, P = HostProbe> {
    exec: E,
    probe: P,
    transport: Transport,
    retries: u32,
    interval: Duration,
    by_path_dir: String,
}

impl SessionManager<HostExecutor, HostProbe> {
    /// session manager running `iscsiadm` on this host
    pub fn host(cfg: &IscsiCfg) -> Self {
        SessionManager::new(HostExecutor::new(), HostProbe, cfg)
    }
}

impl<E: Executor, P: DeviceProbe> SessionManager<E, P> {
    pub fn new(exec: E, probe: P, cfg: &IscsiCfg) -> Self {
        SessionManager {
            exec,
            probe,
            transport: cfg.transport().clone(),
            retries: cfg.retries(),
            interval: cfg.interval(),
            by_path_dir: cfg.by_path_dir().trim_end_matches('/').to_string(),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Expected by-path name of the device, a glob for non-TCP transports.
    pub fn device_path(&self, desc: &ConnectionDescriptor) -> String {
        let name = format!(
            "ip-{}-iscsi-{}-lun-{}",
            desc.target_portal, desc.target_iqn, desc.target_lun
        );
        if self.transport.is_tcp() {
            format!("{}/{}", self.by_path_dir, name)
        } else {
            format!("{}/pci-*-{}", self.by_path_dir, name)
        }
    }

    /// Attaches the target and returns the local device path.
    ///
    /// A device that is already present is returned without touching the
    /// initiator. On timeout the logged-in session is left in place; call
    /// `disconnect` to clean it up.
    pub fn connect(&self, desc: &ConnectionDescriptor) -> Result<String> {
        let portal = desc.target_portal.as_str();
        let iqn = desc.target_iqn.as_str();
        info!(
            "Connect portal: {} targetiqn: {} targetlun: {}",
            portal, iqn, desc.target_lun
        );

        let expected = self.device_path(desc);
        if let Some(path) = self.wait(&expected, 1) {
            debug!("device {} already present", path);
            return Ok(path);
        }

        self.discovery(portal)?;
        if desc.has_auth() {
            self.set_auth(portal, iqn, &desc.auth_user, &desc.auth_password)?;
        }
        self.login(portal, iqn)?;

        match self.wait(&expected, self.retries) {
            Some(path) => {
                info!("device {} is ready", path);
                Ok(path)
            }
            None => anyhow::bail!(NbpError::DeviceTimeout {
                path: expected,
                attempts: self.retries,
            }),
        }
    }

    /// Logs out of the session and removes the node record. Delete is not
    /// attempted when logout fails.
    pub fn disconnect<S: AsRef<str>>(&self, portal: S, iqn: S) -> Result<()> {
        let (portal, iqn) = (portal.as_ref(), iqn.as_ref());
        info!("Disconnect portal: {} targetiqn: {}", portal, iqn);

        self.logout(portal, iqn)?;
        self.delete(iqn)?;

        Ok(())
    }

    pub fn discovery(&self, portal: &str) -> Result<()> {
        self.iscsiadm(&["-m", "discovery", "-t", "sendtargets", "-p", portal])
            .with_context(|| format!("discovery of portal {}", portal))?;
        Ok(())
    }

    pub fn set_auth(&self, portal: &str, iqn: &str, user: &str, password: &str) -> Result<()> {
        self.update_node(portal, iqn, "node.session.auth.username", user)
            .with_context(|| format!("set auth username for {}", iqn))?;
        self.update_node(portal, iqn, "node.session.auth.password", password)
            .with_context(|| format!("set auth password for {}", iqn))?;
        Ok(())
    }

    pub fn login(&self, portal: &str, iqn: &str) -> Result<()> {
        self.iscsiadm(&["-m", "node", "-p", portal, "-T", iqn, "--login"])
            .with_context(|| format!("login to {} at {}", iqn, portal))?;
        Ok(())
    }

    pub fn logout(&self, portal: &str, iqn: &str) -> Result<()> {
        self.iscsiadm(&["-m", "node", "-p", portal, "-T", iqn, "--logout"])
            .with_context(|| format!("logout of {} at {}", iqn, portal))?;
        Ok(())
    }

    pub fn delete(&self, iqn: &str) -> Result<()> {
        self.iscsiadm(&["-m", "node", "-o", "delete", "-T", iqn])
            .with_context(|| format!("delete node {}", iqn))?;
        Ok(())
    }

    fn update_node(&self, portal: &str, iqn: &str, name: &str, value: &str) -> Result<String> {
        self.iscsiadm(&[
            "-m",
            "node",
            "-p",
            portal,
            "-T",
            iqn,
            "--op=update",
            "--name",
            name,
            "--value",
            value,
        ])
    }

    fn iscsiadm(&self, args: &[&str]) -> Result<String> {
        self.exec.run(ISCSIADM, args)
    }

    fn wait(&self, path: &str, attempts: u32) -> Option<String> {
        wait_for_path(&self.probe, path, attempts, &self.transport, self.interval)
    }
}

/// Returns the initiator names configured on this host. A missing or
/// unreadable file yields an empty list.
pub fn initiators<P: AsRef<Path>>(path: P) -> Vec<String> {
    match fs::read_to_string(path.as_ref()) {
        Ok(text) => parse_initiators(&text),
        Err(e) => {
            warn!(
                "failed to read initiator names from {}: {}",
                path.as_ref().display(),
                e
            );
            Vec::new()
        }
    }
}

pub fn parse_initiators(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim())
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.strip_prefix(INITIATOR_KEY))
        .map(|iqn| iqn.trim().to_string())
        .filter(|iqn| !iqn.is_empty())
        .collect()
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use anyhow::Result;

    use super::*;
    use crate::exec::test::RecordingExecutor;
    use crate::probe::test::ScriptedProbe;
    use crate::{classify, ErrorKind};

    const PORTAL: &str = "10.0.0.1:3260";
    const IQN: &str = "iqn.2017-01.demo:vol1";
    const DEVICE: &str = "/dev/disk/by-path/ip-10.0.0.1:3260-iscsi-iqn.2017-01.demo:vol1-lun-0";

    fn manager(
        exec: &RecordingExecutor,
        probe: &ScriptedProbe,
    ) -> SessionManager<RecordingExecutor, ScriptedProbe> {
        let cfg = IscsiCfg::default().with_interval(Duration::ZERO);
        SessionManager::new(exec.clone(), probe.clone(), &cfg)
    }

    #[test]
    fn test_device_path() {
        let desc = ConnectionDescriptor::new(PORTAL, IQN, 0);
        let exec = RecordingExecutor::default();
        let probe = ScriptedProbe::default();
        assert_eq!(manager(&exec, &probe).device_path(&desc), DEVICE);

        let cfg = IscsiCfg::default().with_transport("iser");
        let sm = SessionManager::new(exec, probe, &cfg);
        assert_eq!(
            sm.device_path(&desc),
            "/dev/disk/by-path/pci-*-ip-10.0.0.1:3260-iscsi-iqn.2017-01.demo:vol1-lun-0"
        );
    }

    #[test]
    fn test_connect_existing_device() -> Result<()> {
        let exec = RecordingExecutor::default();
        let probe = ScriptedProbe::missing_then_present(0);
        let path = manager(&exec, &probe).connect(&ConnectionDescriptor::new(PORTAL, IQN, 0))?;

        assert_eq!(path, DEVICE);
        assert!(exec.calls().is_empty());
        assert_eq!(probe.count("stat"), 1);
        Ok(())
    }

    #[test]
    fn test_connect_discovers_and_logs_in() -> Result<()> {
        let exec = RecordingExecutor::default();
        // absent on the first probe, present after two polls
        let probe = ScriptedProbe::missing_then_present(2);
        let path = manager(&exec, &probe).connect(&ConnectionDescriptor::new(PORTAL, IQN, 0))?;

        assert_eq!(path, DEVICE);
        assert_eq!(
            exec.calls(),
            vec![
                format!("iscsiadm -m discovery -t sendtargets -p {}", PORTAL),
                format!("iscsiadm -m node -p {} -T {} --login", PORTAL, IQN),
            ]
        );
        assert_eq!(probe.count("stat"), 3);
        Ok(())
    }

    #[test]
    fn test_connect_iser_resolves_pci_path() -> Result<()> {
        let resolved =
            "/dev/disk/by-path/pci-0000:3b:00.0-ip-10.0.0.1:3260-iscsi-iqn.2017-01.demo:vol1-lun-0";
        let exec = RecordingExecutor::default();
        let probe = ScriptedProbe::default();
        {
            // missing before login and on the first poll after it
            let mut globs = probe.globs.lock().unwrap();
            globs.push_back(vec![]);
            globs.push_back(vec![]);
            globs.push_back(vec![resolved.to_string()]);
        }
        let cfg = IscsiCfg::default()
            .with_transport("iser")
            .with_interval(Duration::ZERO);
        let sm = SessionManager::new(exec.clone(), probe.clone(), &cfg);
        let path = sm.connect(&ConnectionDescriptor::new(PORTAL, IQN, 0))?;

        assert_eq!(path, resolved);
        assert!(!path.contains('*'));
        assert_eq!(
            exec.calls(),
            vec![
                format!("iscsiadm -m discovery -t sendtargets -p {}", PORTAL),
                format!("iscsiadm -m node -p {} -T {} --login", PORTAL, IQN),
            ]
        );
        assert_eq!(probe.count("glob /dev/disk/by-path/pci-*-ip-"), 3);
        assert_eq!(probe.count("stat"), 0);
        Ok(())
    }

    #[test]
    fn test_connect_sets_chap_before_login() -> Result<()> {
        let exec = RecordingExecutor::default();
        let probe = ScriptedProbe::missing_then_present(1);
        let desc = ConnectionDescriptor::new(PORTAL, IQN, 0).with_chap("chap", "admin", "s3cret");
        manager(&exec, &probe).connect(&desc)?;

        let calls = exec.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].contains("discovery"));
        assert!(calls[1].ends_with("--name node.session.auth.username --value admin"));
        assert!(calls[2].ends_with("--name node.session.auth.password --value s3cret"));
        assert!(calls[3].ends_with("--login"));
        Ok(())
    }

    #[test]
    fn test_connect_auth_failure_aborts() {
        let exec = RecordingExecutor::default().fail_on("iscsiadm -m node -p 10.0.0.1:3260 -T iqn.2017-01.demo:vol1 --op=update");
        let probe = ScriptedProbe::never_present();
        let desc = ConnectionDescriptor::new(PORTAL, IQN, 0).with_chap("chap", "admin", "s3cret");
        let err = manager(&exec, &probe).connect(&desc).unwrap_err();

        assert_eq!(classify(&err), ErrorKind::ExternalTool);
        assert!(!exec.calls().iter().any(|c| c.ends_with("--login")));
    }

    #[test]
    fn test_connect_discovery_failure() {
        let exec = RecordingExecutor::default().fail_on("iscsiadm -m discovery");
        let probe = ScriptedProbe::never_present();
        let err = manager(&exec, &probe)
            .connect(&ConnectionDescriptor::new(PORTAL, IQN, 0))
            .unwrap_err();

        assert_eq!(classify(&err), ErrorKind::ExternalTool);
        assert_eq!(exec.calls().len(), 1);
        assert_eq!(probe.count("stat"), 1);
    }

    #[test]
    fn test_connect_timeout() {
        let exec = RecordingExecutor::default();
        let probe = ScriptedProbe::never_present();
        let err = manager(&exec, &probe)
            .connect(&ConnectionDescriptor::new(PORTAL, IQN, 0))
            .unwrap_err();

        match err.downcast_ref::<NbpError>() {
            Some(NbpError::DeviceTimeout { path, attempts }) => {
                assert_eq!(path, DEVICE);
                assert_eq!(*attempts, 10);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(classify(&err), ErrorKind::Timeout);
        // one initial probe plus ten polls, nine pauses between them
        assert_eq!(probe.count("stat"), 11);
        assert_eq!(probe.count("pause"), 9);
        // no rollback of the login
        assert!(!exec.calls().iter().any(|c| c.contains("--logout")));
    }

    #[test]
    fn test_disconnect() -> Result<()> {
        let exec = RecordingExecutor::default();
        let probe = ScriptedProbe::default();
        manager(&exec, &probe).disconnect(PORTAL, IQN)?;

        assert_eq!(
            exec.calls(),
            vec![
                format!("iscsiadm -m node -p {} -T {} --logout", PORTAL, IQN),
                format!("iscsiadm -m node -o delete -T {}", IQN),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_disconnect_logout_failure_skips_delete() {
        let exec = RecordingExecutor::default().fail_on("iscsiadm -m node -p");
        let probe = ScriptedProbe::default();
        assert!(manager(&exec, &probe).disconnect(PORTAL, IQN).is_err());
        assert_eq!(exec.calls().len(), 1);
    }

    #[test]
    fn test_descriptor_from_json() -> Result<()> {
        let desc = ConnectionDescriptor::from_json(serde_json::json!({
            "targetPortal": PORTAL,
            "targetIqn": IQN,
            "targetLun": 3,
            "authMethod": "chap",
            "authUserName": "admin",
            "authPassword": "s3cret",
            "targetDiscovered": true,
            "unknownKey": "ignored",
        }))?;
        assert_eq!(desc.target_portal, PORTAL);
        assert_eq!(desc.target_lun, 3);
        assert_eq!(desc.auth_user, "admin");
        assert!(desc.target_discovered);
        assert!(desc.has_auth());
        assert!(desc.volume_id.is_empty());
        assert!(!format!("{:?}", desc).contains("s3cret"));

        let empty = ConnectionDescriptor::from_json(serde_json::json!({}))?;
        assert_eq!(empty, ConnectionDescriptor::default());
        Ok(())
    }

    #[test]
    fn test_initiators() -> Result<()> {
        let text = "## DO NOT EDIT\n#InitiatorName=iqn.commented:out\nInitiatorName=iqn.1993-08.org.debian:01:abcdef\n\nInitiatorName=iqn.2005-03.org.open-iscsi:second\n";
        assert_eq!(
            parse_initiators(text),
            vec![
                "iqn.1993-08.org.debian:01:abcdef",
                "iqn.2005-03.org.open-iscsi:second"
            ]
        );

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(text.as_bytes())?;
        assert_eq!(initiators(file.path()).len(), 2);

        assert!(initiators("/nonexistent/initiatorname.iscsi").is_empty());
        Ok(())
    }
}
