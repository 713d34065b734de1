//! The NS delegation cache.
//!
//! A size-bounded LRU of [`NsZone`]s keyed by zone name, where size is
//! counted in records (NS entries plus glue addresses) rather than zones.
//! Zones marked persistent survive eviction: they are re-inserted with the
//! minimum TTL the moment they fall out, so bootstrap anchors like the root
//! never disappear.

use std::{
    collections::HashSet,
    net::IpAddr,
    sync::Arc,
};

use hickory_proto::{
    op::Message,
    rr::{Name, RecordType},
};
use lru_cache::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    client::Client,
    error::{Error, ErrorKind},
    msg::{has_ns_type, reply_to},
    zone::{sanitize_delegation, NsZone, MINIMUM_NS_TTL},
};

/// Cache capacity, in records, when none is specified.
pub const DEFAULT_NS_CACHE_CAPACITY: usize = 1024;

/// A suffix-keyed LRU of authoritative delegations.
pub struct NsCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    lru: LruCache<Name, Arc<NsZone>>,
    records: usize,
    persistent: HashSet<Name>,
}

struct Evicted {
    zone: Arc<NsZone>,
    persistent: bool,
}

impl Inner {
    fn remove(&mut self, name: &Name) -> Option<Evicted> {
        let zone = self.lru.remove(name)?;
        self.records -= zone.len();
        Some(Evicted {
            persistent: self.persistent.contains(name),
            zone,
        })
    }

    /// Pop least-recently-used zones until the record count fits.
    fn shrink_to_capacity(&mut self, capacity: usize, evicted: &mut Vec<Evicted>) {
        while self.records > capacity {
            let Some((name, zone)) = self.lru.remove_lru() else {
                break;
            };
            self.records -= zone.len();
            evicted.push(Evicted {
                persistent: self.persistent.contains(&name),
                zone,
            });
        }
    }
}

impl Default for NsCache {
    fn default() -> Self {
        Self::new(DEFAULT_NS_CACHE_CAPACITY)
    }
}

impl NsCache {
    /// Create a cache bounded to `capacity` records (0 means the default).
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_NS_CACHE_CAPACITY
        } else {
            capacity
        };
        Self {
            capacity,
            inner: Mutex::new(Inner {
                // entry-count bound never triggers; record accounting rules
                lru: LruCache::new(usize::MAX),
                records: 0,
                persistent: HashSet::new(),
            }),
        }
    }

    /// Number of zones currently cached.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().lru.is_empty()
    }

    /// Number of records currently accounted for.
    pub fn records(&self) -> usize {
        self.inner.lock().records
    }

    /// Store a zone, replacing any previous entry under its name and
    /// evicting least-recently-used zones until the cache fits.
    pub fn add(&self, zone: Arc<NsZone>) -> Result<(), Error> {
        if !zone.is_valid() {
            return Err(Error::from(ErrorKind::InvalidZone).with_name(zone.name()));
        }
        zone.ensure_ttl();

        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            let name = zone.name().clone();
            if let Some(old) = inner.lru.insert(name, zone.clone()) {
                inner.records -= old.len();
            }
            inner.records += zone.len();
            inner.shrink_to_capacity(self.capacity, &mut evicted);
        }

        debug!(
            zone = %zone.name(),
            records = zone.len(),
            ttl = zone.original_ttl(),
            "cached delegation"
        );
        self.finish_evictions(evicted);
        Ok(())
    }

    /// Build and store a zone from a static `{ns name -> address}` map.
    pub fn add_map(
        &self,
        name: Name,
        ttl: u32,
        entries: impl IntoIterator<Item = (Name, IpAddr)>,
    ) -> Result<(), Error> {
        self.add(NsZone::from_map(name, ttl, entries))
    }

    /// The zone stored under exactly this name, if present and fresh.
    pub fn get(&self, name: &Name) -> Option<Arc<NsZone>> {
        let (found, evicted) = {
            let mut inner = self.inner.lock();
            match inner.lru.get_mut(name) {
                Some(zone) if !zone.expired() => (Some(zone.clone()), None),
                Some(_) => (None, inner.remove(name)),
                None => (None, None),
            }
        };
        if let Some(evicted) = evicted {
            self.finish_evictions(vec![evicted]);
        }
        found
    }

    /// The zone for the longest cached suffix of `qname`.
    pub fn lookup(&self, qname: &Name) -> Option<Arc<NsZone>> {
        let mut evicted = Vec::new();
        let found = {
            let mut inner = self.inner.lock();
            let mut found = None;
            for suffix in Self::suffixes(qname) {
                match inner.lru.get_mut(&suffix) {
                    Some(zone) if !zone.expired() => {
                        found = Some(zone.clone());
                        break;
                    }
                    Some(_) => {
                        if let Some(gone) = inner.remove(&suffix) {
                            evicted.push(gone);
                        }
                    }
                    None => {}
                }
            }
            found
        };
        self.finish_evictions(evicted);
        found
    }

    /// Force a zone out of the cache.
    pub fn evict(&self, name: &Name) {
        let evicted = self.inner.lock().remove(name);
        if let Some(evicted) = evicted {
            self.finish_evictions(vec![evicted]);
        }
    }

    /// Mark or unmark a zone for restore-on-evict. Marking a name that is
    /// not cached fails.
    pub fn set_persistent(&self, name: &Name, persistent: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if !persistent {
            inner.persistent.remove(name);
            return Ok(());
        }
        if !inner.lru.contains_key(name) {
            return Err(Error::from(ErrorKind::Refused).with_name(name));
        }
        inner.persistent.insert(name.clone());
        Ok(())
    }

    /// The label-boundary suffixes of a name, longest first, ending at the
    /// root: `a.b.c.` yields `[a.b.c., b.c., c., .]`.
    pub fn suffixes(qname: &Name) -> Vec<Name> {
        let mut out = Vec::with_capacity(qname.num_labels() as usize + 1);
        let mut name = qname.clone();
        loop {
            let root = name.is_root();
            out.push(name.clone());
            if root {
                break;
            }
            name = name.base_name();
        }
        out
    }

    /// Perform one authoritative exchange step for a request: pick the best
    /// cached zone for the question, ask one of its servers at random, and
    /// validate what comes back.
    ///
    /// An authoritative NODATA that carries a SOA passes through as a valid
    /// message; a success carrying NS records has out-of-authority records
    /// pruned before it is returned.
    pub async fn exchange_with_client<C: Client + ?Sized>(
        &self,
        request: Message,
        client: &C,
    ) -> Result<Message, Error> {
        let Some(query) = request.queries().first() else {
            // nothing to answer
            return Ok(reply_to(&request));
        };
        let qname = query.name().clone();

        let Some(zone) = self.lookup(&qname) else {
            // no suitable servers
            return Err(Error::from(ErrorKind::Refused).with_name(&qname));
        };
        let Some(server) = zone.random_server() else {
            return Err(Error::from(ErrorKind::Refused).with_name(&qname));
        };

        let (mut response, _rtt) = client
            .exchange(request, server)
            .await
            .map_err(|err| err.with_server(server).with_name(&qname))?;

        match Error::from_response(&response) {
            None => {
                if has_ns_type(&response, RecordType::NS) {
                    sanitize_delegation(&mut response, zone.name());
                }
                Ok(response)
            }
            Some(err) if err.is_no_data() => {
                if has_ns_type(&response, RecordType::SOA) {
                    // pass SOA data through so the caller sees NODATA whole
                    Ok(response)
                } else {
                    Err(err.with_server(server))
                }
            }
            Some(err) => Err(err.with_server(server).with_name(&qname)),
        }
    }

    /// Run eviction callbacks outside the cache lock: log the departures
    /// and restore pinned zones with the minimum TTL.
    fn finish_evictions(&self, evicted: Vec<Evicted>) {
        for Evicted { zone, persistent } in evicted {
            debug!(zone = %zone.name(), persistent, "evicted delegation");
            if !persistent {
                continue;
            }
            if self.get(zone.name()).is_some() {
                // a replacement beat us to it
                continue;
            }
            if zone.len() > self.capacity {
                warn!(
                    zone = %zone.name(),
                    records = zone.len(),
                    capacity = self.capacity,
                    "pinned zone larger than the cache; not restoring"
                );
                continue;
            }
            zone.set_ttl(MINIMUM_NS_TTL, MINIMUM_NS_TTL / 2);
            if self.add(zone.clone()).is_ok() {
                debug!(zone = %zone.name(), "restored pinned delegation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    fn map_zone(apex: &str, ttl: u32, n: usize) -> Arc<NsZone> {
        let suffix = if apex == "." { "" } else { apex };
        NsZone::from_map(
            name(apex),
            ttl,
            (0..n).map(|i| {
                (
                    name(&format!("ns{i}.{suffix}")),
                    IpAddr::from(Ipv4Addr::new(192, 0, 2, i as u8 + 1)),
                )
            }),
        )
    }

    #[test]
    fn suffixes_walk_to_the_root() {
        let suffixes = NsCache::suffixes(&name("www.miek.nl."));
        let expected: Vec<Name> = ["www.miek.nl.", "miek.nl.", "nl.", "."]
            .iter()
            .map(|s| name(s))
            .collect();
        assert_eq!(suffixes, expected);

        assert_eq!(NsCache::suffixes(&Name::root()), vec![Name::root()]);
    }

    #[test]
    fn add_rejects_invalid_zones() {
        let cache = NsCache::default();
        let hollow = Arc::new(NsZone::new(name("hollow.test.")));
        let err = cache.add(hollow).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidZone));
        assert!(cache.is_empty());
    }

    #[test]
    fn get_is_exact_and_lookup_is_longest_suffix() {
        let cache = NsCache::default();
        cache.add(map_zone("test.", 300, 2)).unwrap();
        cache.add(map_zone("example.test.", 300, 2)).unwrap();

        assert!(cache.get(&name("test.")).is_some());
        assert!(cache.get(&name("www.example.test.")).is_none());

        let zone = cache.lookup(&name("www.example.test.")).unwrap();
        assert_eq!(zone.name(), &name("example.test."));

        let zone = cache.lookup(&name("elsewhere.test.")).unwrap();
        assert_eq!(zone.name(), &name("test."));

        assert!(cache.lookup(&name("www.example.org.")).is_none());
    }

    #[test]
    fn root_zone_is_the_fallback_for_everything() {
        let cache = NsCache::default();
        cache.add(map_zone(".", 300, 2)).unwrap();

        let zone = cache.lookup(&name("anything.example.org.")).unwrap();
        assert!(zone.name().is_root());
    }

    #[test]
    fn lru_evicts_by_record_count() {
        // each map_zone(_, _, 2) weighs 4 records
        let cache = NsCache::new(8);
        cache.add(map_zone("a.test.", 300, 2)).unwrap();
        cache.add(map_zone("b.test.", 300, 2)).unwrap();
        assert_eq!(cache.records(), 8);

        // touching a.test. makes b.test. the eviction candidate
        assert!(cache.get(&name("a.test.")).is_some());
        cache.add(map_zone("c.test.", 300, 2)).unwrap();

        assert!(cache.records() <= 8);
        assert!(cache.get(&name("a.test.")).is_some());
        assert!(cache.get(&name("b.test.")).is_none());
        assert!(cache.get(&name("c.test.")).is_some());
    }

    #[test]
    fn replacing_a_zone_does_not_double_count() {
        let cache = NsCache::new(100);
        cache.add(map_zone("same.test.", 300, 2)).unwrap();
        cache.add(map_zone("same.test.", 300, 3)).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.records(), 6);
    }

    #[test]
    fn persistent_zones_come_back_after_eviction() {
        let cache = NsCache::default();
        cache.add(map_zone(".", 518_400, 3)).unwrap();
        cache.set_persistent(&Name::root(), true).unwrap();

        let before = cache.lookup(&name("com.")).unwrap();
        cache.evict(&Name::root());

        let after = cache.lookup(&name("com.")).unwrap();
        assert!(after.name().is_root());
        assert_eq!(after.addrs(), before.addrs());
        // restored with the floor TTL
        assert_eq!(after.original_ttl(), MINIMUM_NS_TTL);

        // unpinned zones stay gone
        cache.set_persistent(&Name::root(), false).unwrap();
        cache.evict(&Name::root());
        assert!(cache.lookup(&name("com.")).is_none());
    }

    #[test]
    fn pinning_a_missing_zone_fails() {
        let cache = NsCache::default();
        let err = cache.set_persistent(&name("ghost.test."), true).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Refused));
    }

    #[test]
    fn add_map_round_trips_glue() {
        let cache = NsCache::default();
        let addr = IpAddr::from(Ipv4Addr::new(198, 51, 100, 1));
        cache
            .add_map(
                name("fixed.test."),
                600,
                vec![(name("ns1.fixed.test."), addr)],
            )
            .unwrap();

        let zone = cache.get(&name("fixed.test.")).unwrap();
        assert_eq!(zone.addrs(), vec![addr]);
        assert_eq!(zone.original_ttl(), 600);
    }

    #[tokio::test]
    async fn exchange_without_zone_is_refused() {
        use std::net::SocketAddr;
        use std::time::Duration;

        use crate::client::ExchangeFn;
        use crate::msg::new_request;
        use hickory_proto::op::Query;

        let cache = NsCache::default();
        // surfaces as Internal if the wire is ever touched
        let client = ExchangeFn(|_req: Message, _server: SocketAddr| async move {
            Err::<(Message, Duration), Error>(ErrorKind::Internal("unexpected exchange").into())
        });

        let request = new_request(
            Query::query(name("orphan.test."), RecordType::A),
            4096,
        );
        let err = cache.exchange_with_client(request, &client).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Refused));
        assert_eq!(err.name().unwrap(), &name("orphan.test."));
    }

    #[tokio::test]
    async fn exchange_with_empty_question_replies_directly() {
        use std::net::SocketAddr;
        use std::time::Duration;

        use crate::client::ExchangeFn;

        let cache = NsCache::default();
        let client = ExchangeFn(|_req: Message, _server: SocketAddr| async move {
            Err::<(Message, Duration), Error>(ErrorKind::Internal("unexpected exchange").into())
        });

        let mut request = Message::new();
        request.set_id(42);
        let response = cache.exchange_with_client(request, &client).await.unwrap();
        assert_eq!(response.id(), 42);
        assert!(response.answers().is_empty());
    }
}
