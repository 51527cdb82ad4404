//! Networking utilities for emulated instances.
//!
//! This library provides:
//! - IPv4 CIDR parsing and containment checks
//! - A sequential address pool with explicit release (IPAM)
//!
//! Pools are plain data structures. They do no locking of their own; whoever
//! shares a pool between tasks wraps it in a lock.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Requested address lies outside the pool's host range.
    #[error("address {address} is outside {cidr}")]
    OutOfRange { address: Ipv4Addr, cidr: Ipv4Cidr },

    /// Requested address is already allocated.
    #[error("address {0} is already in use")]
    AlreadyInUse(Ipv4Addr),

    /// Address pool exhausted.
    #[error("address pool exhausted: {0}")]
    PoolExhausted(Ipv4Cidr),
}

// ============================================================================
// CIDR
// ============================================================================

/// IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    /// Network address (host bits cleared).
    address: Ipv4Addr,

    /// Prefix length (e.g. 20 for /20).
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// Create a new CIDR, masking the host bits of `address`.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {prefix_len} exceeds 32"
            )));
        }

        Ok(Self {
            address: Ipv4Addr::from(u32::from(address) & mask(prefix_len)),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g. "10.128.0.0/20").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {s}"
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        self.address
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address is within this network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix_len) == u32::from(self.address)
    }

    /// Number of addresses in the network, including network and broadcast.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix_len))
    }

    /// First address that may be assigned to a host.
    ///
    /// Networks larger than /31 never assign their network or broadcast
    /// address.
    pub fn first_host(&self) -> Ipv4Addr {
        if self.prefix_len >= 31 {
            self.address
        } else {
            Ipv4Addr::from(u32::from(self.address) + 1)
        }
    }

    /// Number of assignable host addresses.
    pub fn host_count(&self) -> u64 {
        if self.prefix_len >= 31 {
            self.size()
        } else {
            self.size() - 2
        }
    }

    /// Offset of `addr` from [`first_host`](Self::first_host), if `addr` is
    /// an assignable host of this network.
    fn host_offset(&self, addr: Ipv4Addr) -> Option<u64> {
        if !self.contains(addr) {
            return None;
        }
        let offset = u64::from(u32::from(addr)).checked_sub(u64::from(u32::from(self.first_host())))?;
        (offset < self.host_count()).then_some(offset)
    }

    fn host_at(&self, offset: u64) -> Ipv4Addr {
        // offset < host_count <= 2^32 - first_host, so this never overflows u32
        Ipv4Addr::from((u64::from(u32::from(self.first_host())) + offset) as u32)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

// ============================================================================
// IPAM (IP Address Management)
// ============================================================================

/// Sequential IPv4 address pool.
///
/// Addresses are handed out by advancing a cursor over the host range of the
/// pool's CIDR, wrapping around at the end and skipping anything still in
/// use. An address leaves the in-use set only through [`release`].
///
/// [`release`]: AddressPool::release
#[derive(Debug, Clone)]
pub struct AddressPool {
    /// Network to allocate from.
    cidr: Ipv4Cidr,

    /// Host offset where the next scan starts.
    cursor: u64,

    /// Addresses currently allocated.
    in_use: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    /// Create an empty pool over `cidr`.
    pub fn new(cidr: Ipv4Cidr) -> Self {
        Self {
            cidr,
            cursor: 0,
            in_use: BTreeSet::new(),
        }
    }

    /// Allocate an address.
    ///
    /// With `preferred`, exactly that address is reserved, or the call fails.
    /// The cursor only moves for cursor-driven allocations.
    pub fn allocate(&mut self, preferred: Option<Ipv4Addr>) -> Result<Ipv4Addr, NetworkError> {
        if let Some(address) = preferred {
            return self.allocate_specific(address);
        }

        let capacity = self.cidr.host_count();
        if self.in_use.len() as u64 >= capacity {
            return Err(NetworkError::PoolExhausted(self.cidr));
        }

        for step in 0..capacity {
            let offset = (self.cursor + step) % capacity;
            let candidate = self.cidr.host_at(offset);
            if self.in_use.insert(candidate) {
                self.cursor = (offset + 1) % capacity;
                return Ok(candidate);
            }
        }

        Err(NetworkError::PoolExhausted(self.cidr))
    }

    /// Reserve a specific address (for requested IPs and recovery).
    ///
    /// Does not advance the cursor.
    pub fn allocate_specific(&mut self, address: Ipv4Addr) -> Result<Ipv4Addr, NetworkError> {
        if self.cidr.host_offset(address).is_none() {
            return Err(NetworkError::OutOfRange {
                address,
                cidr: self.cidr,
            });
        }
        if !self.in_use.insert(address) {
            return Err(NetworkError::AlreadyInUse(address));
        }
        Ok(address)
    }

    /// Return an address to the pool.
    ///
    /// Releasing an address that is not allocated is a no-op. Returns whether
    /// the address was allocated.
    pub fn release(&mut self, address: Ipv4Addr) -> bool {
        self.in_use.remove(&address)
    }

    /// Whether `address` is currently allocated.
    pub fn is_allocated(&self, address: Ipv4Addr) -> bool {
        self.in_use.contains(&address)
    }

    /// Get the network being allocated from.
    pub fn cidr(&self) -> &Ipv4Cidr {
        &self.cidr
    }

    /// Number of addresses currently allocated.
    pub fn in_use(&self) -> u64 {
        self.in_use.len() as u64
    }

    /// Number of addresses still available.
    pub fn available(&self) -> u64 {
        self.cidr.host_count().saturating_sub(self.in_use())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr_parse_masks_host_bits() {
        let cidr = Ipv4Cidr::from_cidr("10.128.3.7/20").unwrap();
        assert_eq!(cidr.network(), ip("10.128.0.0"));
        assert_eq!(cidr.prefix_len(), 20);
        assert_eq!(cidr.to_string(), "10.128.0.0/20");
    }

    #[test]
    fn test_cidr_parse_errors() {
        assert!(matches!(
            Ipv4Cidr::from_cidr("10.0.0.0"),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            Ipv4Cidr::from_cidr("10.0.0.0/33"),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            Ipv4Cidr::from_cidr("10.0.0.300/24"),
            Err(NetworkError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = Ipv4Cidr::from_cidr("10.128.0.0/20").unwrap();
        assert!(cidr.contains(ip("10.128.15.255")));
        assert!(!cidr.contains(ip("10.128.16.0")));
    }

    #[test]
    fn test_host_range() {
        let cidr = Ipv4Cidr::from_cidr("192.168.1.0/24").unwrap();
        assert_eq!(cidr.size(), 256);
        assert_eq!(cidr.host_count(), 254);
        assert_eq!(cidr.first_host(), ip("192.168.1.1"));

        let p2p = Ipv4Cidr::from_cidr("192.168.1.0/31").unwrap();
        assert_eq!(p2p.host_count(), 2);
        assert_eq!(p2p.first_host(), ip("192.168.1.0"));

        let single = Ipv4Cidr::from_cidr("192.168.1.9/32").unwrap();
        assert_eq!(single.host_count(), 1);
    }

    #[test]
    fn test_pool_sequential_allocation() {
        let mut pool = AddressPool::new(Ipv4Cidr::from_cidr("10.0.0.0/29").unwrap());
        assert_eq!(pool.available(), 6);

        assert_eq!(pool.allocate(None).unwrap(), ip("10.0.0.1"));
        assert_eq!(pool.allocate(None).unwrap(), ip("10.0.0.2"));
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_pool_cursor_does_not_reuse_released_address_immediately() {
        let mut pool = AddressPool::new(Ipv4Cidr::from_cidr("10.0.0.0/29").unwrap());
        let first = pool.allocate(None).unwrap();
        pool.release(first);

        assert_eq!(pool.allocate(None).unwrap(), ip("10.0.0.2"));
    }

    #[test]
    fn test_pool_wraps_within_range() {
        let mut pool = AddressPool::new(Ipv4Cidr::from_cidr("10.0.0.0/30").unwrap());
        let a = pool.allocate(None).unwrap();
        let b = pool.allocate(None).unwrap();
        assert_eq!((a, b), (ip("10.0.0.1"), ip("10.0.0.2")));

        pool.release(a);
        assert_eq!(pool.allocate(None).unwrap(), a);
    }

    #[test]
    fn test_pool_exhausted() {
        let mut pool = AddressPool::new(Ipv4Cidr::from_cidr("10.0.0.0/30").unwrap());
        pool.allocate(None).unwrap();
        pool.allocate(None).unwrap();
        assert!(matches!(
            pool.allocate(None),
            Err(NetworkError::PoolExhausted(_))
        ));
    }

    #[test]
    fn test_pool_preferred_address() {
        let mut pool = AddressPool::new(Ipv4Cidr::from_cidr("10.0.0.0/24").unwrap());
        assert_eq!(pool.allocate(Some(ip("10.0.0.50"))).unwrap(), ip("10.0.0.50"));
        assert_eq!(
            pool.allocate(Some(ip("10.0.0.50"))),
            Err(NetworkError::AlreadyInUse(ip("10.0.0.50")))
        );
        // cursor untouched by preferred allocations
        assert_eq!(pool.allocate(None).unwrap(), ip("10.0.0.1"));
    }

    #[test]
    fn test_pool_preferred_outside_host_range() {
        let mut pool = AddressPool::new(Ipv4Cidr::from_cidr("10.0.0.0/24").unwrap());
        for bad in ["10.0.1.1", "10.0.0.0", "10.0.0.255"] {
            assert!(matches!(
                pool.allocate(Some(ip(bad))),
                Err(NetworkError::OutOfRange { .. })
            ));
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_pool_cursor_skips_preferred_reservation() {
        let mut pool = AddressPool::new(Ipv4Cidr::from_cidr("10.0.0.0/29").unwrap());
        pool.allocate(Some(ip("10.0.0.1"))).unwrap();
        assert_eq!(pool.allocate(None).unwrap(), ip("10.0.0.2"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = AddressPool::new(Ipv4Cidr::from_cidr("10.0.0.0/29").unwrap());
        let a = pool.allocate(None).unwrap();
        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert!(!pool.release(ip("172.16.0.1")));
        assert_eq!(pool.available(), 6);
    }

    #[derive(Debug, Clone)]
    enum PoolOp {
        Allocate,
        AllocatePreferred(u8),
        Release(u8),
    }

    fn pool_op() -> impl Strategy<Value = PoolOp> {
        prop_oneof![
            3 => Just(PoolOp::Allocate),
            1 => (0u8..16).prop_map(PoolOp::AllocatePreferred),
            2 => (0u8..16).prop_map(PoolOp::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_pool_never_double_allocates(ops in proptest::collection::vec(pool_op(), 1..200)) {
            let cidr = Ipv4Cidr::from_cidr("10.9.0.0/28").unwrap();
            let mut pool = AddressPool::new(cidr);
            let mut held: BTreeSet<Ipv4Addr> = BTreeSet::new();

            for op in ops {
                match op {
                    PoolOp::Allocate => match pool.allocate(None) {
                        Ok(addr) => {
                            prop_assert!(cidr.contains(addr));
                            prop_assert!(held.insert(addr), "{} handed out twice", addr);
                        }
                        Err(NetworkError::PoolExhausted(_)) => {
                            prop_assert_eq!(held.len() as u64, cidr.host_count());
                        }
                        Err(other) => prop_assert!(false, "unexpected error {}", other),
                    },
                    PoolOp::AllocatePreferred(last) => {
                        let addr = Ipv4Addr::new(10, 9, 0, last);
                        match pool.allocate(Some(addr)) {
                            Ok(got) => {
                                prop_assert_eq!(got, addr);
                                prop_assert!(held.insert(addr));
                            }
                            Err(NetworkError::AlreadyInUse(_)) => prop_assert!(held.contains(&addr)),
                            Err(NetworkError::OutOfRange { .. }) => {
                                prop_assert!(last == 0 || last == 15);
                            }
                            Err(other) => prop_assert!(false, "unexpected error {}", other),
                        }
                    }
                    PoolOp::Release(last) => {
                        let addr = Ipv4Addr::new(10, 9, 0, last);
                        prop_assert_eq!(pool.release(addr), held.remove(&addr));
                    }
                }
                prop_assert_eq!(pool.in_use(), held.len() as u64);
                prop_assert_eq!(pool.available(), cidr.host_count() - held.len() as u64);
            }
        }
    }
}
