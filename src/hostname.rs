// log-enricher - hostname.rs
//
// 4.K Hostname enrichment: given a client IP, resolve a hostname using
// multiple protocols in parallel (rDNS, mDNS, LLMNR, NetBIOS), sharing
// results across devices that share a hardware address.
//
// The "first non-empty result wins, cancel the rest" fan-out is modelled as
// a small supervisor: N probes race against a shared `CancellationToken`,
// the first `Some(_)` cancels the token so late completers exit promptly,
// and the supervisor awaits every `JoinHandle` before returning so no task
// leaks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::cache::PersistedCache;
use crate::model::{FieldValue, LogEntry};
use crate::util::constants::{
    HOSTNAME_LOOKUP_DEADLINE_MS, IPV6_NEIGHBOUR_PROBE_PORT, NEIGHBOUR_TABLE_POLL_INTERVAL_SECS,
};

const MDNS_ADDR: &str = "224.0.0.251:5353";
const LLMNR_ADDR: &str = "224.0.0.252:5355";
const NETBIOS_PORT: u16 = 137;

/// Which discovery protocols are enabled for a given lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolConfig {
    pub rdns: bool,
    pub mdns: bool,
    pub llmnr: bool,
    pub netbios: bool,
}

/// A capability trait for the neighbour table, with two implementations —
/// one backed by the kernel neighbour table, one no-op — selected at build
/// time. The kernel implementation lives behind `cfg(target_os = "linux")`;
/// all other platforms get the no-op.
pub trait NeighbourWatcher: Send + Sync {
    /// Look up a MAC address for an IP from the in-memory neighbour table,
    /// if the platform supports it.
    fn lookup_mac(&self, ip: &IpAddr) -> Option<String>;

    /// Spawn whatever background task keeps this watcher's in-memory table
    /// in sync with the kernel. The no-op watcher's task does nothing but
    /// wait for cancellation, so `PipelineManager::spawn_background_tasks`
    /// can treat every `NeighbourWatcher` uniformly.
    fn spawn_populate(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()>;
}

pub struct NoopNeighbourWatcher;

impl NeighbourWatcher for NoopNeighbourWatcher {
    fn lookup_mac(&self, _ip: &IpAddr) -> Option<String> {
        None
    }

    fn spawn_populate(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            token.cancelled().await;
        })
    }
}

#[cfg(target_os = "linux")]
const PROC_NET_ARP_PATH: &str = "/proc/net/arp";

/// Bit in `/proc/net/arp`'s flags column marking a resolved (`ATF_COM`)
/// entry, as opposed to an incomplete or pending one.
#[cfg(target_os = "linux")]
const ARP_FLAG_COMPLETE: u32 = 0x2;

#[cfg(target_os = "linux")]
pub struct LinuxNeighbourWatcher {
    table: parking_lot::RwLock<std::collections::HashMap<IpAddr, String>>,
}

#[cfg(target_os = "linux")]
impl LinuxNeighbourWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(LinuxNeighbourWatcher {
            table: parking_lot::RwLock::new(std::collections::HashMap::new()),
        })
    }

    /// Record one IP -> MAC resolution into the in-memory table. This is
    /// the insertion point `spawn_populate`'s poll loop calls for every
    /// resolved entry it finds.
    pub fn record(&self, ip: IpAddr, mac: String) {
        self.table.write().insert(ip, mac);
    }

    /// Re-read the kernel neighbour table and reconcile: record every
    /// resolved entry still present, and drop anything this table
    /// previously held that the kernel no longer reports, so state doesn't
    /// outlive a neighbour's actual lease.
    fn refresh_from_proc_net_arp(&self) {
        let contents = match std::fs::read_to_string(PROC_NET_ARP_PATH) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::debug!(error = %e, path = PROC_NET_ARP_PATH, "could not read kernel neighbour table");
                return;
            }
        };

        let mut seen = std::collections::HashSet::new();
        for line in contents.lines().skip(1) {
            let mut fields = line.split_whitespace();
            let (Some(ip_str), Some(_hw_type), Some(flags), Some(mac)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(flags_val) = u32::from_str_radix(flags.trim_start_matches("0x"), 16) else {
                continue;
            };
            if flags_val & ARP_FLAG_COMPLETE == 0 || mac == "00:00:00:00:00:00" {
                continue;
            }
            let Ok(ip) = ip_str.parse::<IpAddr>() else { continue };

            self.record(ip, mac.to_string());
            seen.insert(ip);
        }
        self.table.write().retain(|ip, _| seen.contains(ip));
    }
}

#[cfg(target_os = "linux")]
impl NeighbourWatcher for LinuxNeighbourWatcher {
    fn lookup_mac(&self, ip: &IpAddr) -> Option<String> {
        self.table.read().get(ip).cloned()
    }

    fn spawn_populate(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(NEIGHBOUR_TABLE_POLL_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => self.refresh_from_proc_net_arp(),
                    _ = token.cancelled() => return,
                }
            }
        })
    }
}

pub struct HostnameStage {
    ip_to_mac: Arc<PersistedCache<String>>,
    mac_to_hostname: Arc<PersistedCache<String>>,
    neighbours: Arc<dyn NeighbourWatcher>,
    protocols: ProtocolConfig,
    dns_resolver_addr: Option<String>,
}

impl HostnameStage {
    pub fn new(
        ip_to_mac: Arc<PersistedCache<String>>,
        mac_to_hostname: Arc<PersistedCache<String>>,
        neighbours: Arc<dyn NeighbourWatcher>,
        protocols: ProtocolConfig,
        dns_resolver_addr: Option<String>,
    ) -> Self {
        HostnameStage {
            ip_to_mac,
            mac_to_hostname,
            neighbours,
            protocols,
            dns_resolver_addr,
        }
    }

    /// Per-entry flow. Errors are logged by the caller; this never
    /// fails the entry.
    pub async fn process(&self, entry: &mut LogEntry) {
        let Some(ip_str) = entry.fields.get("client_ip").and_then(FieldValue::as_str_lossy) else {
            return;
        };
        let Ok(ip) = ip_str.parse::<IpAddr>() else {
            return;
        };

        let mut mac = self.ip_to_mac.get(&ip_str);
        if mac.is_none() {
            mac = self.neighbours.lookup_mac(&ip);
        }

        if let Some(ref mac) = mac {
            if let Some(hostname) = self.mac_to_hostname.get(mac) {
                entry.fields.insert("client_hostname".to_string(), FieldValue::String(hostname));
                return;
            }
        }

        if mac.is_none() {
            if let IpAddr::V6(v6) = ip {
                mac = derive_mac_from_eui64(v6);
            }
            probe_ipv6_neighbour_discovery(&ip).await;
        }

        let Some(hostname) = self.discover(ip).await else {
            return;
        };

        if let Some(ref mac) = mac {
            self.ip_to_mac.insert(ip_str.clone(), mac.clone());
            self.mac_to_hostname.insert(mac.clone(), hostname.clone());
        }
        entry.fields.insert("client_hostname".to_string(), FieldValue::String(hostname));
    }

    /// Launch whichever protocols are enabled concurrently; the first
    /// non-empty result wins and cancels the others. Bounded by a total
    /// deadline.
    async fn discover(&self, ip: IpAddr) -> Option<String> {
        let token = CancellationToken::new();
        let winner: Arc<tokio::sync::Mutex<Option<String>>> = Arc::new(tokio::sync::Mutex::new(None));
        let gate = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        if self.protocols.rdns {
            handles.push(spawn_probe(token.clone(), Arc::clone(&winner), Arc::clone(&gate), {
                let resolver_addr = self.dns_resolver_addr.clone();
                move || Box::pin(rdns_lookup(ip, resolver_addr.clone()))
            }));
        }
        if self.protocols.mdns {
            handles.push(spawn_probe(token.clone(), Arc::clone(&winner), Arc::clone(&gate), {
                move || Box::pin(dns_family_lookup(ip, MDNS_ADDR))
            }));
        }
        if self.protocols.llmnr {
            handles.push(spawn_probe(token.clone(), Arc::clone(&winner), Arc::clone(&gate), {
                move || Box::pin(dns_family_lookup(ip, LLMNR_ADDR))
            }));
        }
        if self.protocols.netbios {
            if let IpAddr::V4(v4) = ip {
                handles.push(spawn_probe(token.clone(), Arc::clone(&winner), Arc::clone(&gate), {
                    move || Box::pin(netbios_lookup(v4))
                }));
            }
        }

        let deadline = tokio::time::sleep(Duration::from_millis(HOSTNAME_LOOKUP_DEADLINE_MS));
        tokio::select! {
            _ = deadline => {}
            _ = token.cancelled() => {}
        }
        token.cancel();

        for handle in handles {
            let _ = handle.await;
        }

        winner.lock().await.clone()
    }

    /// Spawn the neighbour watcher's own populate task (kernel-table poll
    /// on Linux, inert wait-for-cancellation elsewhere), so this stage's
    /// `lookup_mac` calls see a live table rather than a permanently empty
    /// one.
    pub fn spawn_neighbour_populate(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.neighbours).spawn_populate(token)
    }

    /// Periodically re-check cached MACs against the live neighbour table
    /// and drop entries the neighbour table now disagrees with. A no-op
    /// neighbour watcher never disagrees, so this is inert unless a
    /// platform neighbour watcher is
    /// wired in.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let stage = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                crate::util::constants::HOSTNAME_REFRESH_INTERVAL_SECS,
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => stage.refresh_once(),
                    _ = token.cancelled() => return,
                }
            }
        })
    }

    fn refresh_once(&self) {
        for (ip_str, cached_mac) in self.ip_to_mac.snapshot() {
            let Ok(ip) = ip_str.parse::<IpAddr>() else { continue };
            if let Some(live_mac) = self.neighbours.lookup_mac(&ip) {
                if live_mac != cached_mac {
                    tracing::debug!(ip = %ip_str, cached_mac, live_mac, "neighbour table disagrees, dropping stale entry");
                    self.ip_to_mac.remove(&ip_str);
                }
            }
        }
    }
}

type ProbeFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Option<String>> + Send>>;

fn spawn_probe(
    token: CancellationToken,
    winner: Arc<tokio::sync::Mutex<Option<String>>>,
    gate: Arc<AtomicBool>,
    probe: impl FnOnce() -> ProbeFuture + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = tokio::select! {
            r = probe() => r,
            _ = token.cancelled() => None,
        };
        if let Some(hostname) = result {
            if !gate.swap(true, Ordering::SeqCst) {
                *winner.lock().await = Some(hostname);
                token.cancel();
            }
        }
    })
}

async fn rdns_lookup(ip: IpAddr, resolver_addr: Option<String>) -> Option<String> {
    use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
    use hickory_resolver::TokioAsyncResolver;

    let config = match resolver_addr {
        Some(addr) => {
            let socket_addr: std::net::SocketAddr = addr.parse().ok()?;
            ResolverConfig::from_parts(None, vec![], NameServerConfigGroup::from_ips_clear(
                &[socket_addr.ip()],
                socket_addr.port(),
                true,
            ))
        }
        None => ResolverConfig::default(),
    };

    let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
    let response = resolver.reverse_lookup(ip).await.ok()?;
    response.iter().next().map(|name| name.to_string().trim_end_matches('.').to_string())
}

/// Shared mDNS/LLMNR probe: both are structurally a multicast DNS PTR query
/// for the reverse-lookup name, differing only in multicast group/port.
async fn dns_family_lookup(ip: IpAddr, multicast_addr: &str) -> Option<String> {
    let name = reverse_lookup_name(ip);
    let query = build_ptr_query(&name, 0x1234);

    let bind_addr = if ip.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await.ok()?;
    socket.send_to(&query, multicast_addr).await.ok()?;

    let mut buf = [0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .ok()?
        .ok()?;
    parse_ptr_response(&buf[..n])
}

async fn netbios_lookup(ip: Ipv4Addr) -> Option<String> {
    let query = build_netbios_nbstat_query();
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.send_to(&query, (ip, NETBIOS_PORT)).await.ok()?;

    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .ok()?
        .ok()?;
    parse_netbios_response(&buf[..n])
}

fn reverse_lookup_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut nibbles = String::new();
            for byte in v6.octets().iter().rev() {
                nibbles.push_str(&format!("{:x}.{:x}.", byte & 0xf, byte >> 4));
            }
            format!("{nibbles}ip6.arpa")
        }
    }
}

/// Build a minimal standards-shaped DNS query for a PTR record.
fn build_ptr_query(name: &str, id: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + name.len());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0000u16.to_be_bytes()); // flags: standard query
    buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    buf.extend_from_slice(&0u16.to_be_bytes()); // ancount
    buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
    buf.extend_from_slice(&0u16.to_be_bytes()); // arcount
    for label in name.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&12u16.to_be_bytes()); // QTYPE PTR
    buf.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    buf
}

/// Best-effort extraction of the first name found in a DNS response's
/// answer section. Not a general-purpose DNS parser: skips the question
/// section by name-length walking, then reads the first resource record's
/// RDATA as an uncompressed domain name.
fn parse_ptr_response(buf: &[u8]) -> Option<String> {
    if buf.len() < 12 {
        return None;
    }
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);
    if ancount == 0 {
        return None;
    }
    let mut pos = 12usize;
    // Skip question section (qdcount is 1 for our own query, but a
    // response from a real stack may echo more; skip all present).
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    for _ in 0..qdcount {
        pos = skip_name(buf, pos)?;
        pos += 4; // QTYPE + QCLASS
    }
    // First answer record.
    pos = skip_name(buf, pos)?;
    if pos + 10 > buf.len() {
        return None;
    }
    let rdlength = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
    pos += 10;
    if pos + rdlength > buf.len() {
        return None;
    }
    decode_name(buf, pos).map(|(name, _)| name.trim_end_matches('.').to_string())
}

fn skip_name(buf: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xc0 == 0xc0 {
            return Some(pos + 2); // compressed pointer, fixed 2 bytes
        }
        pos += 1 + len;
    }
}

/// Decode a (possibly compressed) domain name starting at `pos`, returning
/// the dotted name and the position just past it in the *uncompressed*
/// sense (not meaningful when a pointer was followed, so only used for the
/// first record we care about).
fn decode_name(buf: &[u8], mut pos: usize) -> Option<(String, usize)> {
    let mut labels = Vec::new();
    let start = pos;
    loop {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xc0 == 0xc0 {
            let ptr = (((len & 0x3f) as usize) << 8) | (*buf.get(pos + 1)? as usize);
            let (tail, _) = decode_name(buf, ptr)?;
            labels.push(tail);
            pos += 2;
            break;
        }
        let label = buf.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).to_string());
        pos += 1 + len;
    }
    let _ = start;
    Some((labels.join("."), pos))
}

fn build_netbios_nbstat_query() -> Vec<u8> {
    let mut buf = Vec::with_capacity(50);
    buf.extend_from_slice(&0x1234u16.to_be_bytes()); // transaction id
    buf.extend_from_slice(&0x0000u16.to_be_bytes()); // flags
    buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    // Wildcard NBSTAT name, encoded per RFC 1002 first-level encoding.
    buf.push(32);
    buf.extend_from_slice(b"CKAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
    buf.push(0);
    buf.extend_from_slice(&0x21u16.to_be_bytes()); // QTYPE NBSTAT
    buf.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    buf
}

/// Parse a NetBIOS NBSTAT response for the first name entry (service 0x00,
/// the workstation/unique name).
fn parse_netbios_response(buf: &[u8]) -> Option<String> {
    // Header (12 bytes) + question name (34 bytes) + QTYPE/QCLASS (4) +
    // RR name (2, compressed pointer) + TYPE/CLASS/TTL/RDLENGTH (10) +
    // NUM_NAMES (1 byte) then NUM_NAMES * 18-byte entries.
    let names_count_pos = 12 + 34 + 4 + 2 + 10;
    let num_names = *buf.get(names_count_pos)? as usize;
    if num_names == 0 {
        return None;
    }
    let first = buf.get(names_count_pos + 1..names_count_pos + 1 + 15)?;
    let name = String::from_utf8_lossy(first).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Derive a MAC address from an IPv6 address's modified EUI-64 interface
/// identifier, when the address is SLAAC-derived. Tried before any network
/// probe since it requires no I/O.
fn derive_mac_from_eui64(addr: Ipv6Addr) -> Option<String> {
    let segments = addr.segments();
    let iid = [
        (segments[4] >> 8) as u8,
        segments[4] as u8,
        (segments[5] >> 8) as u8,
        segments[5] as u8,
        (segments[6] >> 8) as u8,
        segments[6] as u8,
        (segments[7] >> 8) as u8,
        segments[7] as u8,
    ];
    if iid[3] != 0xff || iid[4] != 0xfe {
        return None;
    }
    let mut mac = [iid[0], iid[1], iid[2], iid[5], iid[6], iid[7]];
    mac[0] ^= 0x02; // flip the universal/local bit set during EUI-64 derivation
    Some(
        mac.iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

/// Stimulate IPv6 neighbour discovery by sending a UDP datagram to the
/// target so the kernel populates its neighbour table. The
/// datagram itself is expected to be unanswered; only the side effect of
/// triggering Neighbour Solicitation matters.
async fn probe_ipv6_neighbour_discovery(ip: &IpAddr) {
    let IpAddr::V6(v6) = ip else { return };
    if let Ok(socket) = UdpSocket::bind("[::]:0").await {
        let _ = socket.send_to(&[0u8], (*v6, IPV6_NEIGHBOUR_PROBE_PORT)).await;
    }
}
