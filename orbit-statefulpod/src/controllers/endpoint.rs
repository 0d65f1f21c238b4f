use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

use super::owned_metadata;
use crate::crd::{StatefulPod, ENDPOINT_FINALIZER};
use crate::error::{Error, Result};
use crate::store::ResourceStore;

/// Manages the discovery endpoint shared by all replicas of a workload.
pub struct EndpointController<S> {
    store: Arc<S>,
}

impl<S: ResourceStore> EndpointController<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn template(&self, sp: &StatefulPod) -> Result<Service> {
        let spec = sp
            .spec
            .service_template
            .clone()
            .ok_or(Error::MissingField("spec.serviceTemplate"))?;

        Ok(Service {
            metadata: owned_metadata(sp, sp.endpoint_name(), None)?,
            spec: Some(spec),
            ..Default::default()
        })
    }

    /// Creates the endpoint if it is missing. Returns true when it already
    /// existed, in which case the protective finalizer is ensured.
    pub async fn ensure_created(&self, sp: &StatefulPod) -> Result<bool> {
        let name = sp.endpoint_name();
        let existing: Option<Service> = self.store.get(sp.namespace().as_deref(), &name).await?;

        let Some(mut service) = existing else {
            let service = self.template(sp)?;
            return match self.store.create(&service).await {
                Ok(_) => {
                    info!(endpoint = %name, "Created discovery endpoint");
                    Ok(false)
                }
                Err(e) if e.is_already_exists() => Ok(false),
                Err(e) => Err(e),
            };
        };

        if !service.finalizers().iter().any(|f| f == ENDPOINT_FINALIZER) {
            service.finalizers_mut().push(ENDPOINT_FINALIZER.to_string());
            match self.store.replace(&service).await {
                Ok(_) => debug!(endpoint = %name, "Protected discovery endpoint"),
                Err(e) if e.is_conflict() => {
                    debug!(endpoint = %name, "Endpoint changed, protecting on a later pass")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Drops our finalizer from the endpoint, leaving any others in place.
    pub async fn remove_protective_marker(&self, sp: &StatefulPod) -> Result<()> {
        let name = sp.endpoint_name();
        let Some(mut service) = self
            .store
            .get::<Service>(sp.namespace().as_deref(), &name)
            .await?
        else {
            return Ok(());
        };

        if !service.finalizers().iter().any(|f| f == ENDPOINT_FINALIZER) {
            return Ok(());
        }
        service.finalizers_mut().retain(|f| f != ENDPOINT_FINALIZER);
        self.store.replace(&service).await?;
        info!(endpoint = %name, "Released discovery endpoint");
        Ok(())
    }
}
