//! # Tenant Environment Registry
//!
//! Process-wide, lazily populated map from tenant id to its storage
//! environment. The contract is simple: the same id yields the same handle
//! for the lifetime of the process, and the registry never evicts (tenant
//! count is assumed bounded; a deployment with unbounded tenant churn needs
//! an eviction layer this crate does not provide).
//!
//! A miss validates the id, ensures a directory record exists in the
//! membership directory (auto-created with empty membership), creates the
//! on-disk directory, opens the environment with the configured tuning, and
//! installs the schema. Open failures are fatal to the request that caused
//! them, reported to the caller; a later request for the same tenant retries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::directory::TenantDirectory;
use crate::error::Result;
use crate::store::TenantEnv;
use crate::types::TenantId;

pub struct TenantRegistry {
    tenants_root: PathBuf,
    params: crate::config::DbParams,
    envs: Mutex<HashMap<TenantId, Arc<TenantEnv>>>,
}

impl TenantRegistry {
    /// Creates the registry and eagerly opens the `default` environment,
    /// which also hosts the membership directory's persistence.
    pub fn open(cfg: &Config) -> Result<Self> {
        let registry = Self {
            tenants_root: cfg.db_dir.join("tenants"),
            params: cfg.db_params.clone(),
            envs: Mutex::new(HashMap::new()),
        };
        let default = TenantEnv::open(
            &registry.tenants_root,
            &TenantId::default_tenant(),
            &registry.params,
        )?;
        registry
            .envs
            .lock()
            .expect("registry mutex poisoned")
            .insert(TenantId::default_tenant(), default);
        Ok(registry)
    }

    /// The eagerly opened `default` environment.
    pub fn default_env(&self) -> Arc<TenantEnv> {
        self.envs
            .lock()
            .expect("registry mutex poisoned")
            .get(&TenantId::default_tenant())
            .cloned()
            .expect("default environment opened at startup")
    }

    /// Returns the environment for `tenant`, opening it on first use.
    pub fn get_env(
        &self,
        tenant: &TenantId,
        directory: &TenantDirectory,
    ) -> Result<Arc<TenantEnv>> {
        let mut envs = self.envs.lock().expect("registry mutex poisoned");
        if let Some(env) = envs.get(tenant) {
            return Ok(Arc::clone(env));
        }

        directory.ensure(tenant)?;
        let env = TenantEnv::open(&self.tenants_root, tenant, &self.params)?;
        envs.insert(tenant.clone(), Arc::clone(&env));
        Ok(env)
    }
}
