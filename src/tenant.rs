use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::engine::Engine;
use crate::limits::*;
use crate::reaper;

/// Manages per-tenant engines. Each tenant gets its own Engine, WAL, reaper and compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Safe file stem, one per tenant name. ASCII alphanumerics and `_`
    /// pass through; every other byte becomes `-` plus two hex digits.
    fn wal_file_stem(tenant: &str) -> io::Result<String> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        if tenant.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }
        let mut stem = String::with_capacity(tenant.len());
        for b in tenant.bytes() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                stem.push(char::from(b));
            } else {
                stem.push_str(&format!("-{b:02x}"));
            }
        }
        // 255-byte file name limit, minus ".wal".
        if stem.len() > 251 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        Ok(stem)
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = Self::wal_file_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // Entry lock: two first connections to one tenant must not replay the WAL twice.
        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_reaper(engine.clone()));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        info!("tenant {tenant:?} loaded ({} room types)", engine.state.len());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
