//! The NS data and glue for one delegation point.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use hickory_proto::rr::{
    rdata::{A, AAAA, NS},
    DNSClass, Name, RData, Record, RecordType,
};
use hickory_proto::op::Message;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;

use crate::{
    error::{Error, ErrorKind},
    msg::{canonicalize, record_ip},
};

/// The minimum time, in seconds, entries remain in the NS cache.
pub const MINIMUM_NS_TTL: u32 = 10;

/// Port used for every nameserver address derived from glue.
const DNS_PORT: u16 = 53;

/// An authoritative zone as learned from a delegation: the NS owner names
/// for the zone and the addresses ("glue") known for each of them.
///
/// All mutation happens under the zone's own mutex; readers snapshot.
#[derive(Debug)]
pub struct NsZone {
    name: Name,
    inner: Mutex<ZoneInner>,
}

#[derive(Debug, Default)]
struct ZoneInner {
    ns: Vec<Name>,
    glue: HashMap<Name, Vec<IpAddr>>,
    // derived from glue on every mutation
    servers: Vec<SocketAddr>,
    ttl: u32,
    until: Option<Instant>,
    half_life: Option<Instant>,
}

impl ZoneInner {
    fn rebuild_servers(&mut self) {
        self.servers.clear();
        for name in &self.ns {
            if let Some(addrs) = self.glue.get(name) {
                for ip in addrs {
                    self.servers.push(SocketAddr::new(*ip, DNS_PORT));
                }
            }
        }
    }

    fn set_ttl(&mut self, mut ttl: u32, mut half: u32) {
        if ttl == 0 && half == 0 {
            ttl = MINIMUM_NS_TTL;
            half = ttl / 2;
        } else if ttl < MINIMUM_NS_TTL {
            // too short, but preserve the half-life value
            ttl = MINIMUM_NS_TTL;
        }

        if half >= ttl {
            half = ttl / 2;
        }

        let now = Instant::now();
        self.ttl = ttl;
        self.until = Some(now + Duration::from_secs(u64::from(ttl)));
        self.half_life = Some(now + Duration::from_secs(u64::from(half)));
    }
}

impl NsZone {
    /// Create a blank zone for a name.
    pub fn new(name: Name) -> Self {
        Self {
            name: canonicalize(name),
            inner: Mutex::new(ZoneInner::default()),
        }
    }

    /// The domain name this zone is authoritative for.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// When the cached information stops being valid, if a TTL was set.
    pub fn expires_at(&self) -> Option<Instant> {
        self.inner.lock().until
    }

    /// True once the zone's TTL has run out.
    pub fn expired(&self) -> bool {
        match self.inner.lock().until {
            Some(until) => Instant::now() >= until,
            None => false,
        }
    }

    /// Seconds of validity remaining.
    pub fn remaining_ttl(&self) -> u32 {
        match self.inner.lock().until {
            Some(until) => until
                .saturating_duration_since(Instant::now())
                .as_secs()
                .try_into()
                .unwrap_or(u32::MAX),
            None => 0,
        }
    }

    /// The TTL the zone was stored with.
    pub fn original_ttl(&self) -> u32 {
        self.inner.lock().ttl
    }

    /// Advisory: the half-life has passed and a refresh may be worthwhile.
    pub fn needs_refresh(&self) -> bool {
        match self.inner.lock().half_life {
            Some(half_life) => Instant::now() >= half_life,
            None => true,
        }
    }

    /// Number of records stored: NS entries plus glue addresses.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.ns.len() + inner.glue.values().map(Vec::len).sum::<usize>()
    }

    /// True when the zone stores nothing at all.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().ns.is_empty()
    }

    /// A zone is storable when it has a name, at least one NS, and at
    /// least one address to ask.
    pub fn is_valid(&self) -> bool {
        self.name.is_fqdn() && !self.is_empty() && self.has_glue()
    }

    /// Set expiration and half-life, in seconds from now.
    ///
    /// The TTL is floored at [`MINIMUM_NS_TTL`]; a half-life at or past the
    /// TTL collapses to half of it.
    pub fn set_ttl(&self, ttl: u32, half: u32) {
        self.inner.lock().set_ttl(ttl, half);
    }

    /// Give the zone the default TTL if none was ever set.
    pub(crate) fn ensure_ttl(&self) {
        let mut inner = self.inner.lock();
        if inner.ttl == 0 {
            inner.set_ttl(0, 0);
        }
    }

    /// Register an NS owner name. Returns false for an empty or root name,
    /// or one already registered.
    pub fn add_ns(&self, name: Name) -> bool {
        if name.is_root() || name.num_labels() == 0 {
            return false;
        }
        let name = canonicalize(name);

        let mut inner = self.inner.lock();
        if inner.glue.contains_key(&name) {
            return false;
        }
        inner.ns.push(name.clone());
        inner.glue.insert(name, Vec::new());
        true
    }

    /// Append addresses to a registered NS, deduplicating by IP equality.
    /// Returns true if at least one new address was stored.
    pub fn add_glue(&self, name: &Name, addrs: &[IpAddr]) -> bool {
        let mut inner = self.inner.lock();
        let Some(known) = inner.glue.get_mut(name) else {
            return false;
        };

        let mut added = false;
        for addr in addrs {
            if !known.contains(addr) {
                known.push(*addr);
                added = true;
            }
        }
        if added {
            inner.rebuild_servers();
        }
        added
    }

    /// Replace the glue set for a registered NS. Returns false if the name
    /// is not one of the zone's NS entries.
    pub fn set_glue(&self, name: &Name, addrs: Vec<IpAddr>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.glue.contains_key(name) {
            return false;
        }
        inner.glue.insert(name.clone(), addrs);
        inner.rebuild_servers();
        true
    }

    /// Register a name as NS (if new) and add its addresses.
    pub fn add_glue_ns(&self, name: Name, addrs: &[IpAddr]) -> bool {
        let name = canonicalize(name);
        self.add_ns(name.clone());
        self.add_glue(&name, addrs)
    }

    /// Store the address carried by an A/AAAA record, if its owner is a
    /// registered NS.
    pub fn add_glue_record(&self, record: &Record) -> bool {
        match record_ip(record) {
            Some(ip) => self.add_glue(&record.name().to_lowercase(), &[ip]),
            None => false,
        }
    }

    /// True if any NS has at least one address.
    pub fn has_glue(&self) -> bool {
        self.inner.lock().glue.values().any(|addrs| !addrs.is_empty())
    }

    /// One server address chosen uniformly at random.
    pub fn random_server(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .servers
            .choose(&mut rand::rng())
            .copied()
    }

    /// All server addresses, in NS registration order.
    pub fn servers(&self) -> Vec<SocketAddr> {
        self.inner.lock().servers.clone()
    }

    /// All glue addresses, sorted.
    pub fn addrs(&self) -> Vec<IpAddr> {
        let mut out: Vec<IpAddr> = {
            let inner = self.inner.lock();
            inner.glue.values().flatten().copied().collect()
        };
        out.sort_unstable();
        out
    }

    /// Call `f` for each registered NS with a snapshot of its glue.
    pub fn for_each_ns(&self, mut f: impl FnMut(&Name, &[IpAddr])) {
        let snapshot: Vec<(Name, Vec<IpAddr>)> = {
            let inner = self.inner.lock();
            inner
                .ns
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        inner.glue.get(name).cloned().unwrap_or_default(),
                    )
                })
                .collect()
        };
        for (name, addrs) in &snapshot {
            f(name, addrs);
        }
    }

    /// Synthesize NS records for the zone with the residual TTL.
    pub fn export_ns(&self) -> Vec<Record> {
        let ttl = self.remaining_ttl();
        let inner = self.inner.lock();
        inner
            .ns
            .iter()
            .map(|ns| {
                Record::from_rdata(self.name.clone(), ttl, RData::NS(NS(ns.clone())))
            })
            .collect()
    }

    /// Synthesize A/AAAA records for the known glue with the residual TTL.
    pub fn export_glue(&self) -> Vec<Record> {
        let ttl = self.remaining_ttl();
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for ns in &inner.ns {
            let Some(addrs) = inner.glue.get(ns) else {
                continue;
            };
            for ip in addrs {
                let rdata = match ip {
                    IpAddr::V4(v4) => RData::A(A(*v4)),
                    IpAddr::V6(v6) => RData::AAAA(AAAA(*v6)),
                };
                out.push(Record::from_rdata(ns.clone(), ttl, rdata));
            }
        }
        out
    }

    /// Build a zone from the NS records in a delegation response's
    /// authority section, plus whatever glue its additional section offers.
    ///
    /// For a pure delegation (empty answer section) NS records that do not
    /// share the first owner name are dropped, and glue is restricted to
    /// the accepted NS targets. The zone's TTL is the minimum across every
    /// accepted record.
    pub fn from_delegation(response: &Message) -> Result<Arc<Self>, Error> {
        let pure = response.answers().is_empty();

        let mut zone: Option<Arc<Self>> = None;
        let mut ttl = u32::MAX;

        for record in response.name_servers() {
            if record.dns_class() != DNSClass::IN {
                continue;
            }
            let RData::NS(ns) = record.data() else {
                continue;
            };

            let cut = match zone.clone() {
                Some(cut) => {
                    if pure && cut.name() != record.name() {
                        // NS for a different cut; ignore
                        continue;
                    }
                    cut
                }
                None => {
                    let cut = Arc::new(Self::new(record.name().clone()));
                    zone = Some(cut.clone());
                    cut
                }
            };

            if cut.add_ns(ns.0.clone()) {
                ttl = ttl.min(record.ttl());
            }
        }

        let Some(zone) = zone else {
            return Err(ErrorKind::InvalidZone.into());
        };

        for record in response.additionals() {
            if record.dns_class() != DNSClass::IN {
                continue;
            }
            if zone.add_glue_record(record) {
                ttl = ttl.min(record.ttl());
            }
        }

        zone.set_ttl(ttl, ttl / 2);
        Ok(zone)
    }

    /// Build a zone from an authoritative NS answer. Glue comes from the
    /// additional section; missing glue is the caller's problem to fill.
    pub fn from_ns_answer(response: &Message) -> Result<Arc<Self>, Error> {
        let mut zone: Option<Arc<Self>> = None;
        let mut ttl = u32::MAX;

        for record in response.answers() {
            if record.dns_class() != DNSClass::IN {
                continue;
            }
            let RData::NS(ns) = record.data() else {
                continue;
            };

            let apex = match zone.clone() {
                Some(apex) => apex,
                None => {
                    let apex = Arc::new(Self::new(record.name().clone()));
                    zone = Some(apex.clone());
                    apex
                }
            };
            if apex.add_ns(ns.0.clone()) {
                ttl = ttl.min(record.ttl());
            }
        }

        let Some(zone) = zone else {
            return Err(ErrorKind::InvalidZone.into());
        };

        for record in response.additionals() {
            if record.dns_class() != DNSClass::IN {
                continue;
            }
            if zone.add_glue_record(record) {
                ttl = ttl.min(record.ttl());
            }
        }

        zone.set_ttl(ttl, ttl / 2);
        Ok(zone)
    }

    /// Build a zone from a static `{ns name -> address}` map.
    pub fn from_map(
        name: Name,
        ttl: u32,
        entries: impl IntoIterator<Item = (Name, IpAddr)>,
    ) -> Arc<Self> {
        let zone = Arc::new(Self::new(name));
        for (ns, addr) in entries {
            zone.add_glue_ns(ns, &[addr]);
        }
        let ttl = ttl.max(MINIMUM_NS_TTL);
        zone.set_ttl(ttl, ttl / 2);
        zone
    }
}

/// Prune a delegation response down to records the given authority may
/// speak for.
///
/// A pure delegation (empty answer section) keeps only NS records for a
/// single cut inside the authority, and only A/AAAA additionals naming the
/// surviving NS targets. A hybrid response only sheds NS records that fall
/// outside the authority.
pub(crate) fn sanitize_delegation(response: &mut Message, authority: &Name) {
    if !response.answers().is_empty() {
        response.name_servers_mut().retain(|rr| {
            if rr.dns_class() == DNSClass::IN && rr.record_type() == RecordType::NS {
                authority.zone_of(rr.name())
            } else {
                true
            }
        });
        return;
    }

    // pure delegation: one cut and its addresses
    let mut cut: Option<Name> = None;
    let mut targets: HashSet<Name> = HashSet::new();

    response.name_servers_mut().retain(|rr| {
        if rr.dns_class() != DNSClass::IN {
            return false;
        }
        let RData::NS(ns) = rr.data() else {
            return true;
        };
        if let Some(cut) = &cut {
            if cut == rr.name() {
                targets.insert(ns.0.to_lowercase());
                true
            } else {
                false
            }
        } else if authority.zone_of(rr.name()) {
            cut = Some(rr.name().clone());
            targets.insert(ns.0.to_lowercase());
            true
        } else {
            false
        }
    });

    response.additionals_mut().retain(|rr| {
        if rr.dns_class() != DNSClass::IN {
            return false;
        }
        match rr.record_type() {
            RecordType::A | RecordType::AAAA => targets.contains(&rr.name().to_lowercase()),
            _ => true,
        }
    });
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use hickory_proto::op::{MessageType, Query};

    use super::*;

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    fn ns_record(owner: &str, target: &str, ttl: u32) -> Record {
        Record::from_rdata(name(owner), ttl, RData::NS(NS(name(target))))
    }

    fn a_record(owner: &str, ip: [u8; 4], ttl: u32) -> Record {
        Record::from_rdata(name(owner), ttl, RData::A(A(Ipv4Addr::from(ip))))
    }

    #[test]
    fn add_ns_rejects_root_and_duplicates() {
        let zone = NsZone::new(name("example.test."));
        assert!(zone.add_ns(name("ns1.example.test.")));
        assert!(!zone.add_ns(name("ns1.example.test.")));
        assert!(!zone.add_ns(Name::root()));
        assert_eq!(zone.len(), 1);
    }

    #[test]
    fn glue_only_attaches_to_registered_ns() {
        let zone = NsZone::new(name("example.test."));
        zone.add_ns(name("ns1.example.test."));

        let ip = IpAddr::from(Ipv4Addr::new(192, 0, 2, 1));
        assert!(!zone.add_glue(&name("stranger.test."), &[ip]));
        assert!(zone.add_glue(&name("ns1.example.test."), &[ip]));
        // same address again: nothing new
        assert!(!zone.add_glue(&name("ns1.example.test."), &[ip]));

        assert!(zone.has_glue());
        assert_eq!(zone.len(), 2);
        assert_eq!(zone.servers(), vec![SocketAddr::new(ip, 53)]);
    }

    #[test]
    fn set_glue_replaces_wholesale() {
        let zone = NsZone::new(name("example.test."));
        zone.add_ns(name("ns1.example.test."));
        zone.add_glue(
            &name("ns1.example.test."),
            &[IpAddr::from(Ipv4Addr::new(192, 0, 2, 1))],
        );

        let fresh = vec![
            IpAddr::from(Ipv4Addr::new(192, 0, 2, 7)),
            IpAddr::from(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 7)),
        ];
        assert!(zone.set_glue(&name("ns1.example.test."), fresh.clone()));
        let mut expected = fresh;
        expected.sort_unstable();
        assert_eq!(zone.addrs(), expected);
    }

    #[test]
    fn ttl_floor_and_half_life_clamp() {
        let zone = NsZone::new(name("short.test."));
        zone.set_ttl(3, 60);
        assert_eq!(zone.original_ttl(), MINIMUM_NS_TTL);
        // residual TTL is at most the floored value
        assert!(zone.remaining_ttl() <= MINIMUM_NS_TTL);
        assert!(!zone.expired());
        assert!(!zone.needs_refresh());
    }

    #[test]
    fn validity_needs_name_ns_and_glue() {
        let zone = NsZone::new(name("example.test."));
        assert!(!zone.is_valid());
        zone.add_ns(name("ns1.example.test."));
        assert!(!zone.is_valid());
        zone.add_glue(
            &name("ns1.example.test."),
            &[IpAddr::from(Ipv4Addr::new(192, 0, 2, 1))],
        );
        assert!(zone.is_valid());
    }

    #[test]
    fn from_map_registers_each_entry() {
        let zone = NsZone::from_map(
            name("static.test."),
            300,
            vec![
                (name("ns1.static.test."), IpAddr::from(Ipv4Addr::new(192, 0, 2, 1))),
                (name("ns2.static.test."), IpAddr::from(Ipv4Addr::new(192, 0, 2, 2))),
            ],
        );
        assert!(zone.is_valid());
        assert_eq!(zone.len(), 4);
        assert_eq!(zone.original_ttl(), 300);
        assert_eq!(zone.export_ns().len(), 2);
        assert_eq!(zone.export_glue().len(), 2);
    }

    fn delegation_response(extra_cut: bool) -> Message {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(name("www.example.test."), RecordType::A));
        msg.add_name_server(ns_record("example.test.", "ns1.example.test.", 7200));
        msg.add_name_server(ns_record("example.test.", "ns2.example.test.", 3600));
        if extra_cut {
            // a second cut that must not survive assembly
            msg.add_name_server(ns_record("other.test.", "ns1.other.test.", 60));
        }
        msg.add_additional(a_record("ns1.example.test.", [192, 0, 2, 1], 1800));
        msg.add_additional(a_record("ns2.example.test.", [192, 0, 2, 2], 900));
        // glue for a name that is not one of the NS targets
        msg.add_additional(a_record("decoy.example.test.", [192, 0, 2, 66], 30));
        msg
    }

    #[test]
    fn from_delegation_builds_one_cut_with_min_ttl() {
        let zone = NsZone::from_delegation(&delegation_response(true)).unwrap();
        assert_eq!(zone.name(), &name("example.test."));
        assert_eq!(zone.len(), 4);
        assert!(zone.is_valid());
        // min over accepted NS (3600) and glue (900); decoy TTL ignored
        assert_eq!(zone.original_ttl(), 900);

        let mut seen = Vec::new();
        zone.for_each_ns(|ns, addrs| seen.push((ns.clone(), addrs.len())));
        assert_eq!(
            seen,
            vec![
                (name("ns1.example.test."), 1),
                (name("ns2.example.test."), 1)
            ]
        );
    }

    #[test]
    fn from_delegation_without_ns_is_invalid() {
        let mut msg = Message::new();
        msg.add_query(Query::query(name("www.example.test."), RecordType::A));
        let err = NsZone::from_delegation(&msg).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidZone));
    }

    #[test]
    fn from_ns_answer_builds_from_answer_section() {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.set_authoritative(true);
        msg.add_query(Query::query(name("example.test."), RecordType::NS));
        msg.add_answer(ns_record("example.test.", "ns1.example.test.", 7200));
        msg.add_additional(a_record("ns1.example.test.", [192, 0, 2, 9], 7200));

        let zone = NsZone::from_ns_answer(&msg).unwrap();
        assert_eq!(zone.name(), &name("example.test."));
        assert!(zone.has_glue());
        assert_eq!(
            zone.servers(),
            vec![SocketAddr::new(IpAddr::from(Ipv4Addr::new(192, 0, 2, 9)), 53)]
        );
    }

    #[test]
    fn sanitize_pure_delegation_prunes_foreign_cuts_and_decoy_glue() {
        let mut msg = delegation_response(true);
        sanitize_delegation(&mut msg, &Name::root());

        assert_eq!(msg.name_servers().len(), 2);
        assert!(msg
            .name_servers()
            .iter()
            .all(|rr| rr.name() == &name("example.test.")));
        // decoy address dropped, true glue kept
        assert_eq!(msg.additionals().len(), 2);
    }

    #[test]
    fn sanitize_pure_delegation_honours_authority() {
        let mut msg = delegation_response(false);
        // authority that does not cover example.test.
        sanitize_delegation(&mut msg, &name("com."));
        assert!(msg.name_servers().is_empty());
        assert!(msg.additionals().is_empty());
    }

    #[test]
    fn sanitize_hybrid_keeps_answers_and_in_zone_ns() {
        let mut msg = delegation_response(true);
        msg.add_answer(a_record("www.example.test.", [192, 0, 2, 80], 60));
        sanitize_delegation(&mut msg, &name("test."));

        // out-of-authority NS (other.test. is inside test., so it stays;
        // the hybrid path only prunes records outside the authority)
        assert_eq!(msg.name_servers().len(), 3);
        assert_eq!(msg.additionals().len(), 3);
        assert_eq!(msg.answers().len(), 1);
    }

    #[test]
    fn random_server_comes_from_glue() {
        let zone = NsZone::from_map(
            name("pick.test."),
            60,
            vec![(name("ns1.pick.test."), IpAddr::from(Ipv4Addr::new(192, 0, 2, 5)))],
        );
        assert_eq!(
            zone.random_server(),
            Some(SocketAddr::new(IpAddr::from(Ipv4Addr::new(192, 0, 2, 5)), 53))
        );

        let empty = NsZone::new(name("empty.test."));
        assert_eq!(empty.random_server(), None);
    }
}
