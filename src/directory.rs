//! # Tenant Membership Directory
//!
//! Answers one question for the ingest path: may this pubkey write to this
//! tenant? Records live in memory behind a single mutex and are written back
//! to the `default` environment's `tenants` table on every mutation, so a
//! restart reloads the same policy.
//!
//! Policy: a record with no members is an open tenant (anyone may write);
//! listing members restricts writes to exactly those pubkeys. Records are
//! auto-created with empty membership the first time a tenant's environment
//! is opened, so freshly addressed tenants start open.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::store::{self, TenantEnv};
use crate::types::TenantId;

/// One tenant's persisted membership record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: String,
    pub created_at: u64,
    /// Hex-encoded author pubkeys allowed to write. Empty means open.
    pub members: HashSet<String>,
}

impl TenantRecord {
    fn new(id: &TenantId) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            id: id.as_str().to_string(),
            created_at,
            members: HashSet::new(),
        }
    }
}

pub struct TenantDirectory {
    records: Mutex<HashMap<TenantId, TenantRecord>>,
    /// Persistence home: the default tenant's environment.
    env: Arc<TenantEnv>,
}

impl TenantDirectory {
    /// Loads every persisted record from the default environment.
    pub fn load(env: Arc<TenantEnv>) -> Result<Self> {
        let mut records = HashMap::new();
        {
            let reader = env.reader()?;
            for (tenant_id, json) in store::load_tenant_records(&reader)? {
                let Ok(tenant) = TenantId::parse(&tenant_id) else {
                    continue;
                };
                match serde_json::from_str::<TenantRecord>(&json) {
                    Ok(record) => {
                        records.insert(tenant, record);
                    }
                    Err(err) => {
                        tracing::warn!(tenant = %tenant_id, %err, "skipping unreadable tenant record");
                    }
                }
            }
        }
        info!(count = records.len(), "loaded tenant directory");

        let directory = Self {
            records: Mutex::new(records),
            env,
        };
        directory.ensure(&TenantId::default_tenant())?;
        Ok(directory)
    }

    /// Creates a record with empty membership if none exists.
    pub fn ensure(&self, tenant: &TenantId) -> Result<()> {
        let mut records = self.records.lock().expect("directory mutex poisoned");
        if records.contains_key(tenant) {
            return Ok(());
        }
        let record = TenantRecord::new(tenant);
        self.persist(&record)?;
        records.insert(tenant.clone(), record);
        info!(tenant = %tenant, "auto-created tenant record");
        Ok(())
    }

    /// Whether `pubkey` may publish into `tenant`.
    pub fn can_write(&self, tenant: &TenantId, pubkey: &[u8; 32]) -> bool {
        let records = self.records.lock().expect("directory mutex poisoned");
        match records.get(tenant) {
            Some(record) if record.members.is_empty() => true,
            Some(record) => record.members.contains(&hex::encode(pubkey)),
            None => false,
        }
    }

    /// Adds a member, closing the tenant to non-members from now on.
    pub fn add_member(&self, tenant: &TenantId, pubkey: &[u8; 32]) -> Result<()> {
        let mut records = self.records.lock().expect("directory mutex poisoned");
        let record = records
            .entry(tenant.clone())
            .or_insert_with(|| TenantRecord::new(tenant));
        record.members.insert(hex::encode(pubkey));
        self.persist(record)
    }

    /// Removes a member. An emptied member list reopens the tenant.
    pub fn remove_member(&self, tenant: &TenantId, pubkey: &[u8; 32]) -> Result<()> {
        let mut records = self.records.lock().expect("directory mutex poisoned");
        if let Some(record) = records.get_mut(tenant) {
            record.members.remove(&hex::encode(pubkey));
            self.persist(record)?;
        }
        Ok(())
    }

    fn persist(&self, record: &TenantRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let conn = self.env.writer();
        store::save_tenant_record(&conn, &record.id, &json)
    }
}
