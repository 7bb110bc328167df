//! Manager-side control plane.
//!
//! Publishes targeted `stop`/`restart` commands on the control channel.
//! Commands go out on both `$LL.control.<service>` and
//! `$LL.control.<service>.>` so instances subscribed with the tail
//! wildcard receive them regardless of broker literal-matching quirks.

use std::sync::Arc;

use chrono::Utc;
use snafu::Snafu;
use tracing::info;
use tracing::warn;

use trellis_bus::BusConnection;
use trellis_bus::BusError;
use trellis_core::ControlCommand;
use trellis_core::ControlMessage;
use trellis_core::subject::control_subject;

use crate::catalog::Catalog;
use crate::catalog::CatalogError;
use crate::registry::InstanceRegistry;
use crate::registry::RegistryError;

/// Errors from control operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ControlError {
    /// The targeted instance does not exist.
    #[snafu(display("instance '{instance_key}' not found"))]
    InstanceNotFound {
        /// Instance key that was targeted.
        instance_key: String,
    },

    /// The targeted instance is not online.
    #[snafu(display("instance '{instance_key}' is not online"))]
    InstanceNotOnline {
        /// Instance key that was targeted.
        instance_key: String,
    },

    /// Publishing the command failed.
    #[snafu(display("failed to publish control command: {source}"))]
    Publish {
        /// Source error.
        source: BusError,
    },

    /// Catalog failure.
    #[snafu(display("{source}"))]
    Catalog {
        /// Source error.
        source: CatalogError,
    },

    /// Registry invariant failure (e.g. deleting an online instance).
    #[snafu(display("{source}"))]
    Registry {
        /// Source error.
        source: RegistryError,
    },
}

impl From<CatalogError> for ControlError {
    fn from(source: CatalogError) -> Self {
        Self::Catalog { source }
    }
}

impl From<RegistryError> for ControlError {
    fn from(source: RegistryError) -> Self {
        Self::Registry { source }
    }
}

/// Targeted lifecycle control over service instances.
pub struct ControlPlane<C> {
    bus: Arc<dyn BusConnection>,
    catalog: C,
    registry: InstanceRegistry<C>,
}

impl<C: Catalog + Clone> ControlPlane<C> {
    pub fn new(bus: Arc<dyn BusConnection>, catalog: C) -> Self {
        let registry = InstanceRegistry::new(catalog.clone());
        Self { bus, catalog, registry }
    }

    /// Stop one instance; marks its row offline once the command is out.
    pub async fn stop_instance(&self, instance_key: &str) -> Result<(), ControlError> {
        let instance = self.require_online(instance_key).await?;
        self.send_command(&instance.service_name, instance_key, ControlCommand::Stop)
            .await?;

        // The instance is exiting; reflect that immediately rather than
        // waiting out the heartbeat timeout. Failure here is not fatal,
        // the sweep will catch up.
        if let Err(err) = self.registry.mark_instance_offline(instance_key).await {
            warn!(%err, instance_key, "failed to mark stopped instance offline");
        }
        Ok(())
    }

    /// Restart one instance via the supervisor contract.
    pub async fn restart_instance(&self, instance_key: &str) -> Result<(), ControlError> {
        let instance = self.require_online(instance_key).await?;
        self.send_command(&instance.service_name, instance_key, ControlCommand::Restart)
            .await
    }

    /// Stop every online instance of a service; returns how many
    /// commands went out.
    pub async fn stop_service_instances(&self, service: &str) -> Result<usize, ControlError> {
        self.fan_out(service, ControlCommand::Stop).await
    }

    /// Restart every online instance of a service.
    pub async fn restart_service_instances(&self, service: &str) -> Result<usize, ControlError> {
        self.fan_out(service, ControlCommand::Restart).await
    }

    /// Delete the row of an offline instance.
    pub async fn delete_offline_instance(&self, instance_key: &str) -> Result<(), ControlError> {
        self.registry.delete(instance_key).await?;
        Ok(())
    }

    async fn fan_out(&self, service: &str, command: ControlCommand) -> Result<usize, ControlError> {
        let instances = self.catalog.list_instances_by_service(service).await?;
        let mut sent = 0;
        for instance in instances.iter().filter(|i| i.online) {
            let result = match command {
                ControlCommand::Stop => self.stop_instance(&instance.instance_key).await,
                ControlCommand::Restart => self.restart_instance(&instance.instance_key).await,
            };
            match result {
                Ok(()) => sent += 1,
                Err(err) => warn!(%err, instance_key = %instance.instance_key, "control command failed"),
            }
        }
        Ok(sent)
    }

    async fn require_online(&self, instance_key: &str) -> Result<trellis_core::Instance, ControlError> {
        let instance = self
            .catalog
            .get_instance(instance_key)
            .await?
            .ok_or_else(|| ControlError::InstanceNotFound {
                instance_key: instance_key.to_string(),
            })?;
        if !instance.online {
            return Err(ControlError::InstanceNotOnline {
                instance_key: instance_key.to_string(),
            });
        }
        Ok(instance)
    }

    async fn send_command(
        &self,
        service: &str,
        instance_key: &str,
        command: ControlCommand,
    ) -> Result<(), ControlError> {
        let message = ControlMessage {
            service: service.to_string(),
            instance_key: instance_key.to_string(),
            command,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&message).expect("control message serializes");

        let base = control_subject(service);
        for subject in [base.clone(), format!("{base}.>")] {
            self.bus
                .publish(&subject, payload.clone())
                .await
                .map_err(|source| ControlError::Publish { source })?;
        }
        info!(command = command.as_str(), service, instance_key, "control command published");
        Ok(())
    }
}
