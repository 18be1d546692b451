//! Driver registry.
//!
//! Built once at service start from the compiled-in driver set (filtered
//! by `drivers.enabled_drivers`), read-only afterwards. A template
//! resolves through its descriptor triple, or names a driver explicitly
//! to bypass matching.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use corral_common::config::DriverOpts;
use corral_common::{Error, Result};
use corral_store::ClusterTemplate;

use crate::driver::{Driver, DriverDescriptor, VersionEntry};

/// One row of the capability matrix reported by [`DriverRegistry::enumerate`].
#[derive(Debug, Clone)]
pub struct DriverInfo {
    pub name: String,
    pub descriptors: Vec<DriverDescriptor>,
    pub versions: Vec<VersionEntry>,
    pub supports_rollback: bool,
}

/// Read-only mapping from template descriptors to drivers.
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
    by_name: HashMap<String, Arc<dyn Driver>>,
}

/// Builder collecting driver registrations before the registry freezes.
#[derive(Default)]
pub struct DriverRegistryBuilder {
    drivers: Vec<Arc<dyn Driver>>,
    enabled: Vec<String>,
}

impl DriverRegistryBuilder {
    /// Restrict registration to the configured driver names
    /// (empty = everything registers).
    pub fn with_opts(mut self, opts: &DriverOpts) -> Self {
        self.enabled = opts.enabled_drivers.clone();
        self
    }

    /// Register a driver. Skipped silently when filtered out by
    /// configuration; duplicate names are an error at build time.
    pub fn register(mut self, driver: Arc<dyn Driver>) -> Self {
        if self.enabled.is_empty() || self.enabled.iter().any(|n| n == driver.name()) {
            self.drivers.push(driver);
        }
        self
    }

    pub fn build(self) -> Result<DriverRegistry> {
        let mut by_name = HashMap::new();
        for driver in &self.drivers {
            if by_name
                .insert(driver.name().to_string(), driver.clone())
                .is_some()
            {
                return Err(Error::conflict(format!(
                    "driver '{}' registered twice",
                    driver.name()
                )));
            }
        }
        info!(count = self.drivers.len(), "driver registry frozen");
        Ok(DriverRegistry {
            drivers: self.drivers,
            by_name,
        })
    }
}

impl DriverRegistry {
    pub fn builder() -> DriverRegistryBuilder {
        DriverRegistryBuilder::default()
    }

    /// Resolve a template to exactly one driver.
    ///
    /// An explicit `driver` field wins; otherwise the descriptor triple
    /// must match exactly one registered driver - zero is NotFound,
    /// more than one is a deployment error surfaced as Conflict.
    pub fn resolve(&self, template: &ClusterTemplate) -> Result<Arc<dyn Driver>> {
        if let Some(name) = &template.driver {
            return self
                .by_name
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found("Driver", name));
        }

        let descriptor = DriverDescriptor::of_template(template);
        let matching: Vec<&Arc<dyn Driver>> = self
            .drivers
            .iter()
            .filter(|d| d.descriptors().contains(&descriptor))
            .collect();

        match matching.len() {
            0 => Err(Error::not_found("Driver", descriptor.to_string())),
            1 => Ok(matching[0].clone()),
            n => Err(Error::conflict(format!(
                "{} drivers match descriptor {}; set an explicit driver on the template",
                n, descriptor
            ))),
        }
    }

    /// The supported image/version matrix across all drivers.
    pub fn enumerate(&self) -> Vec<DriverInfo> {
        self.drivers
            .iter()
            .map(|d| DriverInfo {
                name: d.name().to_string(),
                descriptors: d.descriptors(),
                versions: d.supported_versions(),
                supports_rollback: d.supports_rollback(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::engine::InMemoryStackEngine;
    use crate::stack::StackDriver;
    use corral_common::status::Coe;

    fn k8s_driver() -> Arc<dyn Driver> {
        Arc::new(StackDriver::kubernetes(
            Arc::new(InMemoryStackEngine::new(1)),
            "corral-",
        ))
    }

    fn swarm_driver() -> Arc<dyn Driver> {
        Arc::new(StackDriver::swarm(
            Arc::new(InMemoryStackEngine::new(1)),
            "corral-",
        ))
    }

    fn template(coe: Coe) -> ClusterTemplate {
        ClusterTemplate::new("t", "p1", "u1", "fcos-1", "fedora-coreos", coe)
    }

    #[test]
    fn resolves_by_descriptor() {
        let registry = DriverRegistry::builder()
            .register(k8s_driver())
            .register(swarm_driver())
            .build()
            .unwrap();

        let driver = registry.resolve(&template(Coe::Kubernetes)).unwrap();
        assert_eq!(driver.name(), "stack_k8s_coreos");
        let driver = registry.resolve(&template(Coe::Swarm)).unwrap();
        assert_eq!(driver.name(), "stack_swarm");
    }

    #[test]
    fn unmatched_descriptor_is_not_found() {
        let registry = DriverRegistry::builder()
            .register(k8s_driver())
            .build()
            .unwrap();
        let err = registry.resolve(&template(Coe::Mesos)).unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    /// Minimal driver claiming the same descriptor triple as the k8s
    /// stack driver, under another name.
    struct ShadowDriver;

    #[async_trait::async_trait]
    impl Driver for ShadowDriver {
        fn name(&self) -> &str {
            "shadow"
        }

        fn descriptors(&self) -> Vec<DriverDescriptor> {
            vec![DriverDescriptor::new(
                corral_common::status::ServerType::Vm,
                "fedora-coreos",
                Coe::Kubernetes,
            )]
        }

        fn supported_versions(&self) -> Vec<VersionEntry> {
            vec![]
        }

        async fn create_cluster(
            &self,
            _: &corral_store::Cluster,
            _: &ClusterTemplate,
            _: &[corral_store::NodeGroup],
            _: std::time::Duration,
        ) -> Result<String> {
            unimplemented!()
        }

        async fn update_cluster(
            &self,
            _: &corral_store::Cluster,
            _: &ClusterTemplate,
            _: &[corral_store::NodeGroup],
            _: bool,
        ) -> Result<()> {
            unimplemented!()
        }

        async fn resize_cluster(
            &self,
            _: &corral_store::Cluster,
            _: &corral_store::NodeGroup,
            _: u32,
            _: &[String],
            _: &dyn crate::driver::ScaleManager,
        ) -> Result<()> {
            unimplemented!()
        }

        async fn upgrade_cluster(
            &self,
            _: &corral_store::Cluster,
            _: &ClusterTemplate,
            _: u32,
            _: &corral_store::NodeGroup,
        ) -> Result<()> {
            unimplemented!()
        }

        async fn delete_cluster(&self, _: &corral_store::Cluster) -> Result<()> {
            unimplemented!()
        }

        async fn create_nodegroup(
            &self,
            _: &corral_store::Cluster,
            _: &ClusterTemplate,
            _: &corral_store::NodeGroup,
        ) -> Result<Option<String>> {
            unimplemented!()
        }

        async fn update_nodegroup(
            &self,
            _: &corral_store::Cluster,
            _: &corral_store::NodeGroup,
        ) -> Result<()> {
            unimplemented!()
        }

        async fn delete_nodegroup(
            &self,
            _: &corral_store::Cluster,
            _: &corral_store::NodeGroup,
        ) -> Result<()> {
            unimplemented!()
        }

        async fn poll_cluster(&self, _: &corral_store::Cluster) -> Result<crate::driver::StackPoll> {
            unimplemented!()
        }

        async fn poll_nodegroup(
            &self,
            _: &corral_store::Cluster,
            _: &corral_store::NodeGroup,
        ) -> Result<crate::driver::StackPoll> {
            unimplemented!()
        }
    }

    #[test]
    fn ambiguous_descriptor_is_conflict() {
        let registry = DriverRegistry::builder()
            .register(k8s_driver())
            .register(Arc::new(ShadowDriver))
            .build()
            .unwrap();
        let err = registry.resolve(&template(Coe::Kubernetes)).unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[test]
    fn explicit_driver_field_bypasses_matching() {
        let registry = DriverRegistry::builder()
            .register(k8s_driver())
            .register(swarm_driver())
            .build()
            .unwrap();

        let mut t = template(Coe::Kubernetes);
        t.driver = Some("stack_swarm".into());
        assert_eq!(registry.resolve(&t).unwrap().name(), "stack_swarm");

        t.driver = Some("nope".into());
        assert_eq!(registry.resolve(&t).unwrap_err().kind(), "NotFound");
    }

    #[test]
    fn enabled_filter_drops_drivers() {
        let opts = DriverOpts {
            enabled_drivers: vec!["stack_swarm".into()],
        };
        let registry = DriverRegistry::builder()
            .with_opts(&opts)
            .register(k8s_driver())
            .register(swarm_driver())
            .build()
            .unwrap();
        assert_eq!(registry.enumerate().len(), 1);
        assert_eq!(
            registry.resolve(&template(Coe::Kubernetes)).unwrap_err().kind(),
            "NotFound"
        );
    }

    #[test]
    fn matrix_enumerates_versions() {
        let registry = DriverRegistry::builder()
            .register(k8s_driver())
            .build()
            .unwrap();
        let matrix = registry.enumerate();
        assert_eq!(matrix[0].name, "stack_k8s_coreos");
        assert!(matrix[0].supports_rollback);
        assert!(matrix[0]
            .versions
            .iter()
            .any(|v| v.coe_version == "v1.31.0"));
    }
}
