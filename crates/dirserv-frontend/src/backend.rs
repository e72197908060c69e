//! The backend contract and the storage-backed backend.
//!
//! The dispatcher routes each request to the backend serving the longest
//! matching suffix. [`DirBackend`] wires one configured suffix to a SQLite
//! store, its entry cache and a [`ModifyDriver`]; other backends (an external
//! process bridge, a proxy) would plug in behind the same trait.

use std::sync::Arc;

use dirserv_config::BackendConfig;
use dirserv_core::acl::AccessControl;
use dirserv_core::clock::Clock;
use dirserv_core::dn::{Dn, DnError};
use dirserv_core::modify::ModList;
use dirserv_core::operation::{Operation, Reply};
use dirserv_core::schema::Schema;
use dirserv_storage::cache::EntryCache;
use dirserv_storage::driver::{CheckpointPolicy, ModifyDriver, RetryPolicy};
use dirserv_storage::error::StorageError;
use dirserv_storage::sqlite::SqliteStore;

use crate::stamper::stamp_mods;

/// A served naming context.
pub trait Backend: Send + Sync {
    /// The suffix this backend serves.
    fn suffix(&self) -> &Dn;

    /// Whether the backend implements modify at all.
    fn supports_modify(&self) -> bool {
        true
    }

    /// A read-only backend refuses writes outright.
    fn readonly(&self) -> bool {
        false
    }

    /// The replication principal, when this backend is a replica.
    fn update_dn(&self) -> Option<&Dn> {
        None
    }

    /// Referrals for writers that are not the replication principal.
    fn update_referral(&self) -> &[String] {
        &[]
    }

    /// The modify entry point.
    fn modify(&self, op: &Operation, dn: &Dn, mods: ModList) -> Reply;
}

/// Failure to build a backend from configuration.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid suffix: {0}")]
    Suffix(DnError),

    #[error("invalid update-dn: {0}")]
    UpdateDn(DnError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The storage-backed backend.
pub struct DirBackend {
    suffix: Dn,
    /// Resolved against the global default at construction.
    lastmod: bool,
    readonly: bool,
    update_dn: Option<Dn>,
    update_referral: Vec<String>,
    store: Arc<SqliteStore>,
    driver: ModifyDriver,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DirBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirBackend")
            .field("suffix", &self.suffix)
            .field("lastmod", &self.lastmod)
            .field("readonly", &self.readonly)
            .field("update_dn", &self.update_dn)
            .field("update_referral", &self.update_referral)
            .finish_non_exhaustive()
    }
}

impl DirBackend {
    /// Builds a backend from its configuration section.
    pub fn from_config(
        cfg: &BackendConfig,
        global_lastmod: bool,
        schema: Arc<Schema>,
        acl: Arc<dyn AccessControl>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BackendError> {
        let suffix = Dn::parse(&cfg.suffix).map_err(BackendError::Suffix)?;
        let update_dn = cfg
            .update_dn
            .as_deref()
            .map(Dn::parse)
            .transpose()
            .map_err(BackendError::UpdateDn)?;

        let store = Arc::new(if cfg.database.is_empty() {
            SqliteStore::open_in_memory(Arc::clone(&schema), &cfg.index)?
        } else {
            SqliteStore::open(&cfg.database, Arc::clone(&schema), &cfg.index)?
        });

        let mut driver = ModifyDriver::new(
            Arc::clone(&store) as _,
            Arc::new(EntryCache::new()),
            schema,
            acl,
        )
        .with_retry_policy(RetryPolicy {
            max_retries: cfg.retry.max_retries,
            backoff_ms: cfg.retry.backoff_ms,
            backoff_cap_ms: cfg.retry.backoff_cap_ms,
        });
        if let Some(cp) = cfg.checkpoint {
            driver = driver.with_checkpoint(CheckpointPolicy {
                kbytes: cp.kbytes,
                minutes: cp.minutes,
            });
        }

        Ok(Self {
            suffix,
            lastmod: cfg.lastmod_enabled(global_lastmod),
            readonly: cfg.readonly,
            update_dn,
            update_referral: cfg.update_referral.clone(),
            store,
            driver,
            clock,
        })
    }

    /// The backing store; also the seeding surface for provisioning and
    /// tests.
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }
}

impl Backend for DirBackend {
    fn suffix(&self) -> &Dn {
        &self.suffix
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn update_dn(&self) -> Option<&Dn> {
        self.update_dn.as_ref()
    }

    fn update_referral(&self) -> &[String] {
        &self.update_referral
    }

    fn modify(&self, op: &Operation, dn: &Dn, mut mods: ModList) -> Reply {
        // Only an authoritative backend stamps; a replica applies the
        // stamps its master already produced.
        if self.lastmod && self.update_dn.is_none() {
            stamp_mods(op, self.clock.as_ref(), &mut mods);
        }
        self.driver.modify(op, dn, &mods)
    }
}
