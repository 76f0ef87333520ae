//! Router directory
//!
//! Holds router records learned from the Tor network and picks peers from
//! them. Fast routers and slow routers are stored separately; fast routers
//! are additionally indexed by the services they offer.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Flags a router must carry to be stored at all
pub const REQUIRED_ROUTER_FLAGS: [&str; 3] = ["Running", "Stable", "Valid"];

/// Router flags we act on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterFlags {
    pub fast: bool,
    pub valid: bool,
    pub stable: bool,
    pub running: bool,
    pub exit: bool,
    pub guard: bool,
    pub hs_dir: bool,
    pub authority: bool,
}

impl RouterFlags {
    /// Parse a space-separated flag list (the body of an `s` line)
    pub fn from_flags_line(line: &str) -> Self {
        let mut flags = RouterFlags::default();

        for flag in line.split_whitespace() {
            match flag {
                "Fast" => flags.fast = true,
                "Valid" => flags.valid = true,
                "Stable" => flags.stable = true,
                "Running" => flags.running = true,
                "Exit" => flags.exit = true,
                "Guard" => flags.guard = true,
                "HSDir" => flags.hs_dir = true,
                "Authority" => flags.authority = true,
                _ => {}
            }
        }

        flags
    }

    /// Carries every flag in `REQUIRED_ROUTER_FLAGS`
    pub fn meets_requirements(&self) -> bool {
        self.running && self.stable && self.valid
    }
}

/// A router known to the application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRecord {
    /// Base64 identity digest
    pub identity: String,

    pub digest: String,
    pub nickname: String,
    pub address: IpAddr,
    pub ports: Vec<u16>,

    #[serde(default)]
    pub country_code: Option<String>,

    /// Consensus bandwidth weight
    pub bandwidth: u64,

    pub flags: RouterFlags,
}

impl RouterRecord {
    pub fn new(identity: impl Into<String>, nickname: impl Into<String>, address: IpAddr) -> Self {
        Self {
            identity: identity.into(),
            digest: String::new(),
            nickname: nickname.into(),
            address,
            ports: Vec::new(),
            country_code: None,
            bandwidth: 0,
            flags: RouterFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: &str) -> Self {
        self.flags = RouterFlags::from_flags_line(flags);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// First advertised port as a socket address
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ports.first().map(|port| SocketAddr::new(self.address, *port))
    }
}

#[derive(Default)]
struct Indexes {
    exit: Vec<String>,
    guard: Vec<String>,
    authority: Vec<String>,
    hs_dir: Vec<String>,
}

/// Thread-safe router store
#[derive(Default)]
pub struct RouterDirectory {
    fast: RwLock<HashMap<String, RouterRecord>>,
    slow: RwLock<HashMap<String, RouterRecord>>,
    indexes: RwLock<Indexes>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl RouterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a router.
    ///
    /// Returns `false` if it lacks a required flag or is already known.
    pub fn insert(&self, router: RouterRecord) -> bool {
        if !router.flags.meets_requirements() {
            log::trace!("Skipping router {} without required flags", router.nickname);
            return false;
        }

        if !router.flags.fast {
            let mut slow = write(&self.slow);
            if slow.contains_key(&router.identity) {
                return false;
            }
            slow.insert(router.identity.clone(), router);
            return true;
        }

        let mut fast = write(&self.fast);
        if fast.contains_key(&router.identity) {
            return false;
        }

        let mut indexes = write(&self.indexes);
        let id = &router.identity;
        if router.flags.exit {
            indexes.exit.push(id.clone());
        }
        if router.flags.guard {
            indexes.guard.push(id.clone());
        }
        if router.flags.authority {
            indexes.authority.push(id.clone());
        }
        if router.flags.hs_dir {
            indexes.hs_dir.push(id.clone());
        }
        fast.insert(id.clone(), router);
        true
    }

    /// Look a router up by nickname, fast routers first
    pub fn get_by_name(&self, nickname: &str) -> Option<RouterRecord> {
        let find = |map: &HashMap<String, RouterRecord>| map.values().find(|r| r.nickname == nickname).cloned();
        find(&read(&self.fast)).or_else(|| find(&read(&self.slow)))
    }

    /// Look a router up by identity
    pub fn get(&self, identity: &str) -> Option<RouterRecord> {
        read(&self.fast)
            .get(identity)
            .or(read(&self.slow).get(identity))
            .cloned()
    }

    pub fn fast_count(&self) -> usize {
        read(&self.fast).len()
    }

    pub fn slow_count(&self) -> usize {
        read(&self.slow).len()
    }

    pub fn len(&self) -> usize {
        self.fast_count() + self.slow_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exits(&self) -> Vec<String> {
        read(&self.indexes).exit.clone()
    }

    pub fn guards(&self) -> Vec<String> {
        read(&self.indexes).guard.clone()
    }

    pub fn authorities(&self) -> Vec<String> {
        read(&self.indexes).authority.clone()
    }

    pub fn hs_directories(&self) -> Vec<String> {
        read(&self.indexes).hs_dir.clone()
    }

    /// Pick up to `count` distinct fast routers matching `filter`
    pub fn select_random<F>(&self, count: usize, filter: F) -> Vec<RouterRecord>
    where
        F: Fn(&RouterRecord) -> bool,
    {
        let fast = read(&self.fast);
        let mut candidates: Vec<&RouterRecord> = fast.values().filter(|r| filter(r)).collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.into_iter().take(count).cloned().collect()
    }

    /// Pick one fast exit router
    pub fn random_exit(&self) -> Option<RouterRecord> {
        self.select_random(1, |r| r.flags.exit).into_iter().next()
    }

    /// Drop every router
    pub fn clear(&self) {
        write(&self.fast).clear();
        write(&self.slow).clear();
        *write(&self.indexes) = Indexes::default();
    }
}
