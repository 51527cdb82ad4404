//! Address allocation for instances and reserved (static) addresses.
//!
//! Pools:
//! - one internal pool per (project, region): the project's `default`
//!   subnet in that region, with its first host reserved as the gateway
//! - one external pool per region, shared by every project
//!
//! Each pool sits behind its own lock. Reserved address records sit behind a
//! separate lock that is always taken before any pool lock.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stratus_id::{AddressId, NumericId};
use stratus_networking::{AddressPool, Ipv4Cidr};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ComputeError, ComputeResult};
use crate::naming::{validate_name, validate_project, SelfLinks};

/// Identifies one address pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolKey {
    /// A project's subnet in a region.
    Internal { project: String, region: String },
    /// A region's external range.
    External { region: String },
}

impl PoolKey {
    pub fn internal(project: impl Into<String>, region: impl Into<String>) -> Self {
        Self::Internal {
            project: project.into(),
            region: region.into(),
        }
    }

    pub fn external(region: impl Into<String>) -> Self {
        Self::External {
            region: region.into(),
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal { project, region } => {
                write!(f, "projects/{project}/regions/{region}/subnetworks/default")
            }
            Self::External { region } => write!(f, "regions/{region}/external"),
        }
    }
}

/// Which CIDR backs each pool.
#[derive(Debug, Clone)]
pub struct AddressPlan {
    /// Internal subnet per region.
    pub subnets: HashMap<String, Ipv4Cidr>,
    /// Subnet for regions not listed in `subnets`.
    pub default_subnet: Ipv4Cidr,
    /// External range per region.
    pub external_pools: HashMap<String, Ipv4Cidr>,
    /// External range for regions not listed in `external_pools`.
    pub default_external_pool: Ipv4Cidr,
}

impl AddressPlan {
    pub fn cidr_for(&self, key: &PoolKey) -> Ipv4Cidr {
        match key {
            PoolKey::Internal { region, .. } => self
                .subnets
                .get(region)
                .copied()
                .unwrap_or(self.default_subnet),
            PoolKey::External { region } => self
                .external_pools
                .get(region)
                .copied()
                .unwrap_or(self.default_external_pool),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddressStatus {
    Reserved,
    InUse,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressKey {
    pub project: String,
    pub region: String,
    pub name: String,
}

impl std::fmt::Display for AddressKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "projects/{}/regions/{}/addresses/{}",
            self.project, self.region, self.name
        )
    }
}

/// A reserved external address.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub id: NumericId,
    pub address_id: AddressId,
    pub name: String,
    pub project: String,
    pub region: String,
    pub address: Ipv4Addr,
    pub status: AddressStatus,
    /// Self links of the instances using the address. Cleared on detach.
    pub users: Vec<String>,
    pub creation_timestamp: DateTime<Utc>,
    pub self_link: String,
}

impl Address {
    pub fn key(&self) -> AddressKey {
        AddressKey {
            project: self.project.clone(),
            region: self.region.clone(),
            name: self.name.clone(),
        }
    }
}

/// External IP held by an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalLease {
    pub region: String,
    pub ip: Ipv4Addr,
    /// Set when the IP belongs to a reserved address; otherwise the IP is
    /// ephemeral and goes back to the pool on release.
    pub reserved: Option<AddressKey>,
}

/// Hands out internal and external IPs without collisions.
pub struct AddressAllocator {
    plan: AddressPlan,
    links: SelfLinks,
    pools: RwLock<HashMap<PoolKey, Arc<Mutex<AddressPool>>>>,
    addresses: Mutex<HashMap<AddressKey, Address>>,
}

impl AddressAllocator {
    pub fn new(plan: AddressPlan, links: SelfLinks) -> Self {
        Self {
            plan,
            links,
            pools: RwLock::new(HashMap::new()),
            addresses: Mutex::new(HashMap::new()),
        }
    }

    async fn pool(&self, key: &PoolKey) -> Arc<Mutex<AddressPool>> {
        if let Some(pool) = self.pools.read().await.get(key) {
            return Arc::clone(pool);
        }

        let mut pools = self.pools.write().await;
        let pool = pools
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(self.new_pool(key))));
        Arc::clone(pool)
    }

    fn new_pool(&self, key: &PoolKey) -> AddressPool {
        let cidr = self.plan.cidr_for(key);
        let mut pool = AddressPool::new(cidr);

        if matches!(key, PoolKey::Internal { .. }) && cidr.host_count() > 1 {
            let gateway = cidr.first_host();
            if let Err(e) = pool.allocate_specific(gateway) {
                warn!(pool = %key, error = %e, "Failed to reserve subnet gateway");
            }
        }

        info!(pool = %key, cidr = %cidr, available = pool.available(), "Address pool created");
        pool
    }

    /// Allocate an address from `pool`, exactly `preferred` if given.
    pub async fn allocate(
        &self,
        pool: &PoolKey,
        preferred: Option<Ipv4Addr>,
    ) -> ComputeResult<Ipv4Addr> {
        let address = self.pool(pool).await.lock().await.allocate(preferred)?;
        debug!(pool = %pool, address = %address, "Address allocated");
        Ok(address)
    }

    /// Return an address to `pool`. Unknown or unallocated addresses are
    /// ignored.
    pub async fn release(&self, pool: &PoolKey, address: Ipv4Addr) {
        let Some(pool_lock) = self.pools.read().await.get(pool).cloned() else {
            return;
        };
        if pool_lock.lock().await.release(address) {
            debug!(pool = %pool, address = %address, "Address released");
        }
    }

    /// Free addresses left in `pool`.
    pub async fn available(&self, pool: &PoolKey) -> u64 {
        self.pool(pool).await.lock().await.available()
    }

    /// CIDR backing `pool`.
    pub fn cidr(&self, pool: &PoolKey) -> Ipv4Cidr {
        self.plan.cidr_for(pool)
    }

    // -------------------------------------------------------------------------
    // Reserved addresses
    // -------------------------------------------------------------------------

    /// Reserve a named external address in a region.
    pub async fn reserve_address(
        &self,
        project: &str,
        region: &str,
        name: &str,
        preferred: Option<Ipv4Addr>,
    ) -> ComputeResult<Address> {
        validate_project(project)?;
        validate_name("address", name)?;
        if region.is_empty() {
            return Err(ComputeError::InvalidArgument("region is required".to_string()));
        }

        let key = AddressKey {
            project: project.to_string(),
            region: region.to_string(),
            name: name.to_string(),
        };

        let mut addresses = self.addresses.lock().await;
        if addresses.contains_key(&key) {
            return Err(ComputeError::AlreadyExists(format!("address {key}")));
        }

        let ip = self.allocate(&PoolKey::external(region), preferred).await?;
        let address = Address {
            id: NumericId::random(),
            address_id: AddressId::new(),
            name: name.to_string(),
            project: project.to_string(),
            region: region.to_string(),
            address: ip,
            status: AddressStatus::Reserved,
            users: Vec::new(),
            creation_timestamp: Utc::now(),
            self_link: self.links.address(project, region, name),
        };
        addresses.insert(key.clone(), address.clone());

        info!(address = %key, ip = %ip, "Address reserved");
        Ok(address)
    }

    pub async fn get_address(&self, project: &str, region: &str, name: &str) -> ComputeResult<Address> {
        let key = AddressKey {
            project: project.to_string(),
            region: region.to_string(),
            name: name.to_string(),
        };
        self.addresses
            .lock()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(format!("address {key}")))
    }

    /// Reserved addresses in a region, sorted by name.
    pub async fn list_addresses(&self, project: &str, region: &str) -> Vec<Address> {
        let addresses = self.addresses.lock().await;
        let mut listed: Vec<Address> = addresses
            .values()
            .filter(|a| a.project == project && a.region == region)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        listed
    }

    /// Delete a reserved address and return its IP to the regional pool.
    pub async fn release_address(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> ComputeResult<Address> {
        let key = AddressKey {
            project: project.to_string(),
            region: region.to_string(),
            name: name.to_string(),
        };

        let mut addresses = self.addresses.lock().await;
        let address = addresses
            .get(&key)
            .ok_or_else(|| ComputeError::NotFound(format!("address {key}")))?;

        if address.status == AddressStatus::InUse {
            return Err(ComputeError::FailedPrecondition(format!(
                "address {key} is in use by {}",
                address.users.join(", ")
            )));
        }

        let removed = addresses.remove(&key).ok_or_else(|| {
            ComputeError::Internal(format!("address {key} vanished while locked"))
        })?;
        self.release(&PoolKey::external(region), removed.address).await;

        info!(address = %key, ip = %removed.address, "Address released");
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Instance external access
    // -------------------------------------------------------------------------

    /// Give an instance an external IP.
    ///
    /// A `nat_ip` matching one of the project's reserved addresses in the
    /// region binds that address to `user`. Any other `nat_ip` is claimed
    /// from the regional pool as an ephemeral IP, as is a fresh IP when no
    /// `nat_ip` is given.
    pub async fn bind_external(
        &self,
        project: &str,
        region: &str,
        nat_ip: Option<Ipv4Addr>,
        user: &str,
    ) -> ComputeResult<ExternalLease> {
        let mut addresses = self.addresses.lock().await;

        if let Some(ip) = nat_ip {
            let reserved = addresses
                .values_mut()
                .find(|a| a.project == project && a.region == region && a.address == ip);

            if let Some(address) = reserved {
                if address.status == AddressStatus::InUse {
                    return Err(ComputeError::AlreadyInUse(format!(
                        "address {} ({ip}) is in use by {}",
                        address.name,
                        address.users.join(", ")
                    )));
                }
                address.status = AddressStatus::InUse;
                address.users = vec![user.to_string()];
                debug!(address = %address.key(), user, "Reserved address attached");
                return Ok(ExternalLease {
                    region: region.to_string(),
                    ip,
                    reserved: Some(address.key()),
                });
            }
        }

        let ip = self.allocate(&PoolKey::external(region), nat_ip).await?;
        drop(addresses);

        Ok(ExternalLease {
            region: region.to_string(),
            ip,
            reserved: None,
        })
    }

    /// Undo [`bind_external`](Self::bind_external). Reserved addresses go
    /// back to `RESERVED`; ephemeral IPs go back to the pool.
    pub async fn unbind_external(&self, lease: &ExternalLease) {
        match &lease.reserved {
            Some(key) => {
                let mut addresses = self.addresses.lock().await;
                if let Some(address) = addresses.get_mut(key) {
                    address.status = AddressStatus::Reserved;
                    address.users.clear();
                    debug!(address = %key, "Reserved address detached");
                }
            }
            None => {
                self.release(&PoolKey::external(lease.region.as_str()), lease.ip)
                    .await;
            }
        }
    }
}
