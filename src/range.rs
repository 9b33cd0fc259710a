//! Host and network classifier used for direct-connection lists.
//!
//! An [`AddressRange`] holds three kinds of entries: exact host strings,
//! leading-dot suffixes, and numeric IPv4 ranges. Entries that need DNS
//! resolve in a background thread by default; until resolution lands, the
//! entry matches by name only. Lookups never block on the resolver.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread;

use tracing::debug;

#[derive(Debug, Default)]
struct Table {
    hosts: HashSet<String>,
    suffixes: Vec<String>,
    ranges: Vec<(u32, u32)>,
}

/// Table implementation block
impl Table {
    /// in_ranges reports whether the address falls inside any resolved range.
    fn in_ranges(&self, ip: u32) -> bool {
        self.ranges.iter().any(|(from, to)| *from <= ip && ip <= *to)
    }
}

/// AddressRange classifies destinations for bypass decisions. Entry forms:
///
/// - `"host.example.com"` or `"10.1.2.3"`: one host
/// - `"128.32."`: dotted prefix, covers 128.32.0.0 through 128.32.255.255
/// - `".example.com"`: literal hostname suffix
/// - `"10.0.0.5:10.0.0.90"`: explicit range, either side may be a name
///
/// Clones share the underlying table.
#[derive(Debug, Clone)]
pub struct AddressRange {
    table: Arc<RwLock<Table>>,
    background: bool,
}

impl Default for AddressRange {
    fn default() -> Self {
        Self::new()
    }
}

/// AddressRange implementation block
impl AddressRange {
    /// new builds an empty classifier that resolves host entries in a
    /// background thread.
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(Table::default())),
            background: true,
        }
    }

    /// new_synchronous builds an empty classifier that resolves host
    /// entries inline during [`AddressRange::add`], which then blocks on
    /// DNS but leaves no resolution pending afterwards.
    pub fn new_synchronous() -> Self {
        Self {
            table: Arc::new(RwLock::new(Table::default())),
            background: false,
        }
    }

    /// add records one entry, returning whether it was accepted in a
    /// recognized form. A hostname entry is accepted immediately and
    /// matches by exact name; its numeric range joins the table once the
    /// resolver gets to it, so an address lookup racing the resolver may
    /// miss. In synchronous mode an unresolvable `from:to` entry is
    /// refused outright.
    pub fn add(&self, entry: &str) -> bool {
        let entry = entry.trim();
        if entry.is_empty() {
            return false;
        }

        // Leading dot: hostname suffix, matched literally
        if let Some(rest) = entry.strip_prefix('.') {
            if rest.is_empty() {
                return false;
            }
            self.write().suffixes.push(entry.to_string());
            return true;
        }

        // Trailing dot: dotted prefix covering the enclosed block
        if entry.ends_with('.') {
            return match parse_prefix(entry) {
                Some((from, to)) => {
                    self.publish(from, to);
                    true
                }
                None => false,
            };
        }

        // Colon: explicit from:to pair
        if let Some((from, to)) = entry.split_once(':') {
            if from.is_empty() || to.is_empty() {
                return false;
            }
            return self.add_bounds(from.to_string(), to.to_string());
        }

        // Single host: name matching works right away, the numeric form
        // follows resolution
        self.write().hosts.insert(entry.to_string());
        match entry.parse::<Ipv4Addr>() {
            Ok(ip) => {
                let ip = u32::from(ip);
                self.publish(ip, ip);
                true
            }
            Err(_) => self.add_bounds(entry.to_string(), entry.to_string()),
        }
    }

    /// contains performs the non-blocking containment check: exact host,
    /// then suffix scan, then numeric ranges when the query is an IPv4
    /// literal. The resolver is never consulted.
    pub fn contains(&self, host: &str) -> bool {
        let table = self.read();
        if table.hosts.contains(host) {
            return true;
        }
        if table.suffixes.iter().any(|s| host.ends_with(s.as_str())) {
            return true;
        }
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => table.in_ranges(u32::from(ip)),
            Err(_) => false,
        }
    }

    /// contains_ip checks an address against the resolved numeric ranges.
    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.read().in_ranges(u32::from(ip))
    }

    /// contains_resolve runs the non-blocking check first and, when that
    /// misses on a hostname, resolves the query and re-checks the numeric
    /// ranges with the result. A resolution failure is simply no match.
    pub async fn contains_resolve(&self, host: &str) -> bool {
        if self.contains(host) {
            return true;
        }
        if host.parse::<Ipv4Addr>().is_ok() {
            return false;
        }
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => {
                for addr in addrs {
                    if let SocketAddr::V4(v4) = addr {
                        if self.contains_ip(*v4.ip()) {
                            return true;
                        }
                    }
                }
                false
            }
            Err(_) => false,
        }
    }

    /// is_empty reports whether no entry of any kind has been added.
    pub fn is_empty(&self) -> bool {
        let table = self.read();
        table.hosts.is_empty() && table.suffixes.is_empty() && table.ranges.is_empty()
    }

    fn add_bounds(&self, from: String, to: String) -> bool {
        // Literal bounds need no resolver and publish immediately
        if let (Ok(lo), Ok(hi)) = (from.parse::<Ipv4Addr>(), to.parse::<Ipv4Addr>()) {
            self.publish(u32::from(lo), u32::from(hi));
            return true;
        }

        if self.background {
            let table = Arc::clone(&self.table);
            thread::spawn(move || match resolve_bounds(&from, &to) {
                Some((lo, hi)) => {
                    publish_to(&table, lo, hi);
                    debug!("resolved range entry {from}:{to}");
                }
                None => debug!("could not resolve range entry {from}:{to}, entry stays dormant"),
            });
            true
        } else {
            match resolve_bounds(&from, &to) {
                Some((lo, hi)) => {
                    self.publish(lo, hi);
                    true
                }
                None => false,
            }
        }
    }

    fn publish(&self, from: u32, to: u32) {
        publish_to(&self.table, from, to);
    }

    // Lock poisoning only happens if a resolver thread panicked mid-write;
    // the table is still structurally sound, so keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn publish_to(table: &Arc<RwLock<Table>>, from: u32, to: u32) {
    let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
    table
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .ranges
        .push((lo, hi));
}

/// parse_prefix expands a dotted prefix like "128.32." into the covered
/// block: given octets pin the high bytes, missing octets run 0..=255.
fn parse_prefix(entry: &str) -> Option<(u32, u32)> {
    let stripped = entry.strip_suffix('.')?;
    let labels: Vec<&str> = stripped.split('.').collect();
    if labels.is_empty() || labels.len() > 4 {
        return None;
    }

    let mut from = [0u8; 4];
    let mut to = [255u8; 4];
    for (i, label) in labels.iter().enumerate() {
        let octet: u8 = label.parse().ok()?;
        from[i] = octet;
        to[i] = octet;
    }
    Some((u32::from_be_bytes(from), u32::from_be_bytes(to)))
}

fn resolve_bounds(from: &str, to: &str) -> Option<(u32, u32)> {
    let lo = resolve_blocking(from)?;
    let hi = if to == from { lo } else { resolve_blocking(to)? };
    Some((lo, hi))
}

// Resolution for entries uses the blocking std resolver: the background
// mode runs it off-task in a plain thread, the synchronous mode accepts
// the stall by contract.
fn resolve_blocking(name: &str) -> Option<u32> {
    match name.parse::<Ipv4Addr>() {
        Ok(ip) => Some(u32::from(ip)),
        Err(_) => (name, 0).to_socket_addrs().ok()?.find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(u32::from(*v4.ip())),
            SocketAddr::V6(_) => None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn dotted_prefix_covers_enclosed_block() {
        let range = AddressRange::new();
        assert!(range.add("192.168."));

        assert!(range.contains("192.168.0.0"));
        assert!(range.contains("192.168.254.3"));
        assert!(!range.contains("192.169.0.1"));
        assert!(!range.contains("10.0.0.1"));

        // Bad octets are refused
        assert!(!range.add("192.300."));
        assert!(!range.add("1.2.3.4.5."));
    }

    #[test]
    fn suffix_matching_is_literal() {
        let range = AddressRange::new();
        assert!(range.add(".example.com"));

        assert!(range.contains("www.example.com"));
        assert!(range.contains("deep.sub.example.com"));
        // The bare apex does not end with ".example.com"
        assert!(!range.contains("example.com"));
        assert!(!range.contains("notexample.com"));
        assert!(!range.contains("example.com.evil.net"));
    }

    #[test]
    fn exact_hosts_and_explicit_ranges() {
        let range = AddressRange::new();
        assert!(range.add("intranet"));
        assert!(range.add("10.0.0.5:10.0.0.90"));

        assert!(range.contains("intranet"));
        assert!(!range.contains("intranet2"));

        assert!(range.contains_ip(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(range.contains_ip(Ipv4Addr::new(10, 0, 0, 90)));
        assert!(!range.contains_ip(Ipv4Addr::new(10, 0, 0, 91)));

        // IP entries get their numeric form immediately
        assert!(range.add("172.16.0.1"));
        assert!(range.contains("172.16.0.1"));
        assert!(range.contains_ip(Ipv4Addr::new(172, 16, 0, 1)));
    }

    #[test]
    fn rejects_garbage_entries() {
        let range = AddressRange::new();
        assert!(!range.add(""));
        assert!(!range.add("."));
        assert!(!range.add(":10.0.0.1"));
        assert!(range.is_empty());
    }

    #[test]
    fn synchronous_mode_resolves_during_add() {
        let range = AddressRange::new_synchronous();
        assert!(range.add("localhost"));
        assert!(range.contains("localhost"));
        assert!(range.contains_ip(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn background_resolution_lands_eventually() {
        let range = AddressRange::new();
        assert!(range.add("localhost"));

        // Name matching works before the resolver finishes
        assert!(range.contains("localhost"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !range.contains_ip(Ipv4Addr::LOCALHOST) {
            assert!(Instant::now() < deadline, "resolver never published");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[tokio::test]
    async fn on_demand_resolution_checks_ranges() {
        let range = AddressRange::new();
        assert!(range.add("10.0.0.0:10.255.255.255"));
        assert!(!range.contains_resolve("localhost").await);

        assert!(range.add("127.0.0.0:127.255.255.255"));
        assert!(range.contains_resolve("localhost").await);
    }
}
