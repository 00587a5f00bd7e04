//! In-process registry backend

use super::{Application, Instance, InstanceMatch, Registry};
use crate::error::RegistryError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Registry kept in memory, keyed by application id
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    apps: RwLock<HashMap<String, Application>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an application record
    pub fn put_application(&self, app: Application) {
        self.apps.write().insert(app.id.clone(), app);
    }

    pub fn get(&self, app_id: &str) -> Option<Application> {
        self.apps.read().get(app_id).cloned()
    }

    /// Live instances currently recorded for an application
    pub fn instances(&self, app_id: &str) -> Vec<Instance> {
        self.apps
            .read()
            .get(app_id)
            .map(|a| a.machines.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn find_by_hostname(&self, hostname: &str) -> Result<Option<Application>, RegistryError> {
        Ok(self
            .apps
            .read()
            .values()
            .find(|app| app.host_binding(hostname).is_some())
            .cloned())
    }

    async fn append_instance(&self, app_id: &str, instance: &Instance) -> Result<(), RegistryError> {
        let mut apps = self.apps.write();
        let app = apps
            .get_mut(app_id)
            .ok_or_else(|| RegistryError::UnknownApplication(app_id.to_string()))?;
        if !app.machines.contains(instance) {
            app.machines.push(instance.clone());
        }
        Ok(())
    }

    async fn remove_instance(&self, app_id: &str, target: &InstanceMatch) -> Result<(), RegistryError> {
        if let Some(app) = self.apps.write().get_mut(app_id) {
            app.machines.retain(|m| !target.matches(m));
        }
        Ok(())
    }

    async fn tls_applications(&self) -> Result<Vec<Application>, RegistryError> {
        Ok(self
            .apps
            .read()
            .values()
            .filter(|app| app.accepts_tls())
            .cloned()
            .collect())
    }

    async fn seed(&self, apps: &[Application]) -> Result<(), RegistryError> {
        let mut stored = self.apps.write();
        for app in apps {
            let mut app = app.clone();
            if let Some(existing) = stored.get(&app.id) {
                for machine in &existing.machines {
                    if !app.machines.contains(machine) {
                        app.machines.push(machine.clone());
                    }
                }
            }
            stored.insert(app.id.clone(), app);
        }
        Ok(())
    }
}
