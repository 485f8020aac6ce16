//! Service instance registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use log::info;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::client::{
    AttachmentSpec, ConnectionInfo, DeleteOptions, HostInfo, Metadata, StorageClient, VolumeSpec,
};
use crate::config::BrokerCfg;
use crate::NbpError;

static LV_PATH: &str = "lvPath";

/// Credential set handed to broker consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Credentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,
}

impl Credentials {
    pub fn is_bound(&self) -> bool {
        self.attachment_id.is_some()
    }

    fn clear_binding(&mut self) {
        self.attachment_id = None;
        self.connection_info = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    name: String,
    credentials: Credentials,
}

impl ServiceInstance {
    pub fn new<S: AsRef<str>>(name: S, credentials: Credentials) -> Self {
        ServiceInstance {
            name: name.as_ref().to_string(),
            credentials,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_bound(&self) -> bool {
        self.credentials.is_bound()
    }
}

/// Recognized provisioning parameters, decoded by the protocol layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvisionParameters {
    pub name: String,
    pub description: String,
    /// size in GB
    pub capacity: i64,
    pub lv_path: Option<String>,
    pub metadata: Metadata,
}

impl ProvisionParameters {
    fn volume_spec(&self) -> VolumeSpec {
        VolumeSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            size: self.capacity,
            metadata: with_lv_path(&self.metadata, &self.lv_path),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BindParameters {
    pub lv_path: Option<String>,
    pub metadata: Metadata,
}

fn with_lv_path(metadata: &Metadata, lv_path: &Option<String>) -> Metadata {
    let mut metadata = metadata.clone();
    if let Some(path) = lv_path {
        metadata.insert(LV_PATH.to_string(), path.clone());
    }
    metadata
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub id: String,
    pub description: String,
    pub bindable: bool,
    pub plans: Vec<ServicePlan>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub free: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastOperation {
    pub state: String,
    pub description: String,
}

// `None` marks an instance removed while another caller still held its handle.
type Slot = Arc<Mutex<Option<ServiceInstance>>>;

pub struct Registry<C> {
    client: C,
    host: HostInfo,
    broker: BrokerCfg,
    instances: RwLock<HashMap<String, Slot>>,
}

impl<C: StorageClient> Registry<C> {
    pub fn new(client: C, host: HostInfo, broker: &BrokerCfg) -> Self {
        Registry {
            client,
            host,
            broker: broker.clone(),
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Lists the control-plane profiles as plans of a single bindable service.
    pub fn catalog(&self) -> Result<Catalog> {
        let plans = self
            .client
            .list_profiles()?
            .into_iter()
            .map(|prf| ServicePlan {
                id: prf.id,
                name: prf.name,
                description: prf.description,
                metadata: prf.extra,
                free: true,
            })
            .collect();

        Ok(Catalog {
            services: vec![Service {
                name: self.broker.service_name().to_string(),
                id: self.broker.service_id().to_string(),
                description: self.broker.service_description().to_string(),
                bindable: true,
                plans,
            }],
        })
    }

    /// Provisions a volume and records it under `id`.
    ///
    /// The map stays write-locked across the control-plane call, so creates and
    /// removes never interleave.
    pub fn create_service_instance<S: AsRef<str>>(
        &self,
        id: S,
        params: &ProvisionParameters,
    ) -> Result<Credentials> {
        let id = id.as_ref();
        let mut instances = self.instances.write();
        if instances.contains_key(id) {
            anyhow::bail!(NbpError::InstanceExists(id.to_string()))
        }

        let vol = self.client.create_volume(&params.volume_spec())?;
        let credentials = Credentials {
            image: Some(format!(
                "{}:{}:{}",
                self.broker.image_prefix(),
                vol.name,
                vol.id
            )),
            volume_id: Some(vol.id),
            ..Default::default()
        };

        let instance = ServiceInstance::new(id, credentials.clone());
        instances.insert(id.to_string(), Arc::new(Mutex::new(Some(instance))));
        info!("created service instance {} with volume {:?}", id, credentials.volume_id);

        Ok(credentials)
    }

    /// Deletes the volume of an unbound instance and forgets the instance.
    pub fn remove_service_instance<S: AsRef<str>>(&self, id: S) -> Result<()> {
        let id = id.as_ref();
        let mut instances = self.instances.write();
        let slot = instances
            .get(id)
            .cloned()
            .ok_or_else(|| NbpError::NoInstance(id.to_string()))?;

        let mut guard = slot.lock();
        let instance = guard
            .as_ref()
            .ok_or_else(|| NbpError::NoInstance(id.to_string()))?;
        let volume_id = instance
            .credentials
            .volume_id
            .clone()
            .ok_or_else(|| NbpError::NoVolumeId(id.to_string()))?;
        if instance.is_bound() {
            anyhow::bail!(NbpError::InstanceBound(id.to_string()))
        }

        self.client
            .delete_volume(&volume_id, &DeleteOptions::default())?;

        *guard = None;
        instances.remove(id);
        info!("removed service instance {} and volume {}", id, volume_id);

        Ok(())
    }

    /// Attaches the instance's volume and returns the augmented credentials.
    pub fn bind<S: AsRef<str>>(
        &self,
        id: S,
        binding_id: S,
        params: &BindParameters,
    ) -> Result<Credentials> {
        let (id, binding_id) = (id.as_ref(), binding_id.as_ref());
        let slot = self.slot(id)?;
        let mut guard = slot.lock();
        let instance = guard
            .as_mut()
            .ok_or_else(|| NbpError::NoInstance(id.to_string()))?;
        let volume_id = instance
            .credentials
            .volume_id
            .clone()
            .ok_or_else(|| NbpError::NoVolumeId(id.to_string()))?;
        if instance.is_bound() {
            anyhow::bail!(NbpError::AlreadyBound(id.to_string()))
        }

        let spec = AttachmentSpec {
            volume_id,
            host_info: self.host.clone(),
            metadata: with_lv_path(&params.metadata, &params.lv_path),
        };
        let atc = self.client.create_volume_attachment(&spec)?;

        instance.credentials.attachment_id = Some(atc.id);
        instance.credentials.connection_info = Some(atc.connection_info);
        info!(
            "bound service instance {} as {} via attachment {:?}",
            id, binding_id, instance.credentials.attachment_id
        );

        Ok(instance.credentials.clone())
    }

    /// Deletes the instance's attachment. The instance and its volume stay.
    pub fn unbind<S: AsRef<str>>(&self, id: S, binding_id: S) -> Result<()> {
        let (id, binding_id) = (id.as_ref(), binding_id.as_ref());
        let slot = self.slot(id)?;
        let mut guard = slot.lock();
        let instance = guard
            .as_mut()
            .ok_or_else(|| NbpError::NoInstance(id.to_string()))?;
        let attachment_id = instance
            .credentials
            .attachment_id
            .clone()
            .ok_or_else(|| NbpError::NoAttachmentId(id.to_string()))?;

        self.client
            .delete_volume_attachment(&attachment_id, &DeleteOptions::default())?;

        instance.credentials.clear_binding();
        info!(
            "unbound service instance {} ({}), attachment {} deleted",
            id, binding_id, attachment_id
        );

        Ok(())
    }

    /// Asynchronous provisioning is not supported.
    pub fn last_operation<S: AsRef<str>>(
        &self,
        id: S,
        _service_id: S,
        _plan_id: S,
        _operation: S,
    ) -> Result<LastOperation> {
        anyhow::bail!(NbpError::NotImplemented(format!(
            "last operation of instance '{}'",
            id.as_ref()
        )))
    }

    /// Records an instance that already exists on the control plane, such as
    /// one reloaded after a restart. Replaces any entry under `id`.
    pub fn adopt<S: AsRef<str>>(&self, id: S, instance: ServiceInstance) {
        self.instances
            .write()
            .insert(id.as_ref().to_string(), Arc::new(Mutex::new(Some(instance))));
    }

    /// Snapshot of the instance under `id`.
    pub fn get<S: AsRef<str>>(&self, id: S) -> Option<ServiceInstance> {
        let slot = self.instances.read().get(id.as_ref()).cloned()?;
        let guard = slot.lock();
        guard.clone()
    }

    pub fn contains<S: AsRef<str>>(&self, id: S) -> bool {
        self.instances.read().contains_key(id.as_ref())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids = self.instances.read().keys().cloned().collect::<Vec<String>>();
        ids.sort();
        ids
    }

    fn slot(&self, id: &str) -> Result<Slot> {
        let slot = self
            .instances
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NbpError::NoInstance(id.to_string()))?;
        Ok(slot)
    }
}
