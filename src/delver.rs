//! The iterative resolution engine.
//!
//! A [`Delver`] walks the delegation tree: each pass asks the best cached
//! zone's servers the full question, and the response either answers it,
//! hands down a referral (which is cached, glue and all, before the next
//! pass), or denies it. Sibling nameservers named without glue are resolved
//! by the engine recursing into itself under a bounded deadline.

use std::{
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use async_recursion::async_recursion;
use async_trait::async_trait;
use futures_util::{stream::FuturesUnordered, StreamExt};
use hickory_proto::{
    op::{Message, Query},
    rr::{Name, RData, RecordType},
};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    cache::{NsCache, DEFAULT_NS_CACHE_CAPACITY},
    client::Client,
    error::{Error, ErrorKind},
    hints::{builtin_root_hints, ROOT_HINTS_TTL},
    msg::{
        canonicalize, first_answer_of, has_answer_type, has_ns_type, new_request, record_ip,
        reply_to, strip_aaaa, DEFAULT_UDP_PAYLOAD_SIZE,
    },
    single_flight::{Expiry, SingleFlight},
    zone::NsZone,
    Exchanger,
};

/// Bound on sibling-nameserver resolution while capturing a delegation.
pub const DEFAULT_GLUE_DEADLINE: Duration = Duration::from_secs(1);

/// Bound on delegation-following passes within one lookup.
pub const DEFAULT_MAX_PASSES: usize = 30;

/// Bound on CNAME redirections within one lookup.
pub const DEFAULT_CNAME_LIMIT: u8 = 10;

/// Bound on nested sub-resolutions (glue fill-in, CNAME chases).
const RECURSION_LIMIT: u8 = 16;

/// Configuration for a [`Delver`].
pub struct DelverBuilder {
    aaaa_enabled: bool,
    cache_capacity: usize,
    single_flight_expiry: Expiry,
    glue_deadline: Duration,
    udp_payload_size: u16,
    max_passes: usize,
    cname_limit: u8,
    root_hints: Option<Vec<(Name, IpAddr)>>,
}

impl Default for DelverBuilder {
    fn default() -> Self {
        Self {
            aaaa_enabled: true,
            cache_capacity: DEFAULT_NS_CACHE_CAPACITY,
            single_flight_expiry: Expiry::Default,
            glue_deadline: DEFAULT_GLUE_DEADLINE,
            udp_payload_size: DEFAULT_UDP_PAYLOAD_SIZE,
            max_passes: DEFAULT_MAX_PASSES,
            cname_limit: DEFAULT_CNAME_LIMIT,
            root_hints: None,
        }
    }
}

impl DelverBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow AAAA glue and AAAA glue sub-queries. On by default; turn off
    /// for hosts without usable IPv6.
    pub fn aaaa_enabled(mut self, enabled: bool) -> Self {
        self.aaaa_enabled = enabled;
        self
    }

    /// Delegation cache capacity, in records.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// How long completed exchanges stay deduplicated.
    pub fn single_flight_expiry(mut self, expiry: Expiry) -> Self {
        self.single_flight_expiry = expiry;
        self
    }

    /// Deadline for resolving glueless sibling nameservers.
    pub fn glue_deadline(mut self, deadline: Duration) -> Self {
        self.glue_deadline = deadline;
        self
    }

    /// EDNS advertised UDP payload size.
    pub fn udp_payload_size(mut self, size: u16) -> Self {
        self.udp_payload_size = size;
        self
    }

    /// Bound on delegation-following passes within one lookup.
    pub fn max_passes(mut self, passes: usize) -> Self {
        self.max_passes = passes;
        self
    }

    /// Bound on CNAME redirections within one lookup.
    pub fn cname_limit(mut self, limit: u8) -> Self {
        self.cname_limit = limit;
        self
    }

    /// Replace the built-in root hints.
    pub fn root_hints(mut self, hints: Vec<(Name, IpAddr)>) -> Self {
        self.root_hints = Some(hints);
        self
    }

    /// Build the engine over a wire client, loading (and pinning) the root
    /// hints into a fresh delegation cache.
    pub fn build<C: Client + 'static>(self, client: C) -> Result<Delver<C>, Error> {
        let delver = Delver {
            client: Arc::new(SingleFlight::new(client, self.single_flight_expiry)),
            cache: Arc::new(NsCache::new(self.cache_capacity)),
            aaaa_enabled: self.aaaa_enabled,
            glue_deadline: self.glue_deadline,
            udp_payload_size: self.udp_payload_size,
            max_passes: self.max_passes,
            cname_limit: self.cname_limit,
        };

        match self.root_hints {
            Some(hints) => {
                delver.add_map_persistent(Name::root(), ROOT_HINTS_TTL, hints)?;
            }
            None => delver.add_root_servers()?,
        }
        Ok(delver)
    }
}

/// An iterative resolver over an injected wire [`Client`].
///
/// Cheap to clone; clones share the delegation cache and the single-flight
/// registry, which is also how the engine hands itself to its own glue
/// sub-resolutions.
pub struct Delver<C: Client + 'static> {
    client: Arc<SingleFlight<C>>,
    cache: Arc<NsCache>,
    aaaa_enabled: bool,
    glue_deadline: Duration,
    udp_payload_size: u16,
    max_passes: usize,
    cname_limit: u8,
}

impl<C: Client + 'static> Clone for Delver<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            cache: self.cache.clone(),
            aaaa_enabled: self.aaaa_enabled,
            glue_deadline: self.glue_deadline,
            udp_payload_size: self.udp_payload_size,
            max_passes: self.max_passes,
            cname_limit: self.cname_limit,
        }
    }
}

impl<C: Client + 'static> Delver<C> {
    /// The delegation cache backing this engine.
    pub fn cache(&self) -> &NsCache {
        &self.cache
    }

    /// Load the built-in root hints and pin the root zone.
    pub fn add_root_servers(&self) -> Result<(), Error> {
        let mut hints = Vec::new();
        for (ns, addr) in builtin_root_hints() {
            hints.push((Name::from_ascii(ns)?, addr));
        }
        self.add_map_persistent(Name::root(), ROOT_HINTS_TTL, hints)
    }

    /// Seed a zone from a static `{ns name -> address}` map.
    ///
    /// Addresses of a disabled family are dropped on the way in.
    pub fn add_map(
        &self,
        name: Name,
        ttl: u32,
        entries: impl IntoIterator<Item = (Name, IpAddr)>,
    ) -> Result<(), Error> {
        let name = canonicalize(name);
        let entries = entries
            .into_iter()
            .filter(|(_, addr)| self.family_allowed(*addr));
        self.cache.add_map(name, ttl, entries)
    }

    /// Seed a zone from a static map and pin it against eviction.
    pub fn add_map_persistent(
        &self,
        name: Name,
        ttl: u32,
        entries: impl IntoIterator<Item = (Name, IpAddr)>,
    ) -> Result<(), Error> {
        let name = canonicalize(name);
        self.add_map(name.clone(), ttl, entries)?;
        self.cache.set_persistent(&name, true)
    }

    /// Seed a zone from bare server addresses, under synthetic NS names.
    pub fn add_server(&self, name: Name, ttl: u32, addrs: &[IpAddr]) -> Result<(), Error> {
        let name = canonicalize(name);
        let mut entries = Vec::with_capacity(addrs.len());
        for (i, addr) in addrs.iter().enumerate() {
            let ns = Name::from_ascii(format!("ns{i}"))?.append_domain(&name)?;
            entries.push((ns, *addr));
        }
        self.add_map(name, ttl, entries)
    }

    /// Seed a zone from bare server addresses, then replace the synthetic
    /// entry with the zone's real NS set by asking those servers for it.
    ///
    /// On any failure the synthetic entry is evicted again.
    pub async fn add_from(&self, name: Name, ttl: u32, addrs: &[IpAddr]) -> Result<(), Error> {
        let name = canonicalize(name);
        self.add_server(name.clone(), ttl, addrs)?;

        match self.refresh_zone(&name).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.cache.evict(&name);
                Err(err)
            }
        }
    }

    /// Ask a zone's currently-cached servers for its authoritative NS set
    /// and replace the cache entry with the result.
    async fn refresh_zone(&self, name: &Name) -> Result<(), Error> {
        let request = new_request(
            Query::query(name.clone(), RecordType::NS),
            self.udp_payload_size,
        );
        let mut response = self
            .cache
            .exchange_with_client(request, &*self.client)
            .await?;

        if !response.authoritative() || !has_answer_type(&response, RecordType::NS) {
            return Err(Error::from(ErrorKind::BadResponse).with_name(name));
        }

        if !self.aaaa_enabled {
            strip_aaaa(&mut response);
        }
        let zone = NsZone::from_ns_answer(&response)?;
        self.ensure_glue(&zone, 0).await?;
        self.cache.add(zone)
    }

    /// The one place deciding whether an address family is usable.
    fn family_allowed(&self, addr: IpAddr) -> bool {
        addr.is_ipv4() || self.aaaa_enabled
    }

    /// One pass-by-pass resolution of a single query.
    #[async_recursion]
    async fn resolve(
        &self,
        query: Query,
        depth: u8,
        visited: &mut Vec<Name>,
    ) -> Result<Message, Error> {
        if depth >= RECURSION_LIMIT {
            return Err(
                Error::from(ErrorKind::RecursionExceeded { depth }).with_name(query.name())
            );
        }

        for pass in 0..self.max_passes {
            debug!(query = %query, pass, "resolution pass");

            let request = new_request(query.clone(), self.udp_payload_size);
            let response = self
                .cache
                .exchange_with_client(request, &*self.client)
                .await?;

            if !response.answers().is_empty() {
                return self.handle_answer(response, &query, depth, visited).await;
            }
            if has_ns_type(&response, RecordType::NS) {
                self.handle_delegation(&response, depth).await?;
                continue;
            }
            if has_ns_type(&response, RecordType::SOA) {
                // NODATA: only an authoritative denial may pass through
                return if response.authoritative() {
                    Ok(response)
                } else {
                    Err(Error::from(ErrorKind::BadResponse).with_name(query.name()))
                };
            }
            return Err(Error::from(ErrorKind::BadResponse).with_name(query.name()));
        }

        Err(Error::from(ErrorKind::PassLimitExceeded {
            limit: self.max_passes,
        })
        .with_name(query.name()))
    }

    /// An answer-bearing response: final if it answers the question,
    /// otherwise a CNAME to chase.
    async fn handle_answer(
        &self,
        response: Message,
        query: &Query,
        depth: u8,
        visited: &mut Vec<Name>,
    ) -> Result<Message, Error> {
        if has_answer_type(&response, query.query_type()) {
            return Ok(response);
        }
        if has_answer_type(&response, RecordType::CNAME) {
            return self.chase_cname(response, query, depth, visited).await;
        }
        Err(Error::from(ErrorKind::BadResponse).with_name(query.name()))
    }

    /// A referral: capture the delegation unless a concurrent lookup
    /// already cached this cut, then loop against the fresher zone.
    async fn handle_delegation(&self, response: &Message, depth: u8) -> Result<(), Error> {
        let Some(ns_record) = response
            .name_servers()
            .iter()
            .find(|rr| rr.record_type() == RecordType::NS)
        else {
            return Err(ErrorKind::BadResponse.into());
        };

        let owner = ns_record.name().to_lowercase();
        if self.cache.get(&owner).is_some() {
            return Ok(());
        }

        self.add_delegation(response.clone(), depth).await
    }

    /// Build a zone from a delegation response, fill in missing glue under
    /// the deadline, and cache it.
    async fn add_delegation(&self, mut response: Message, depth: u8) -> Result<(), Error> {
        if !self.aaaa_enabled {
            strip_aaaa(&mut response);
        }

        let zone = NsZone::from_delegation(&response)?;
        self.ensure_glue(&zone, depth).await?;
        self.cache.add(zone)
    }

    /// Resolve sibling nameservers until the zone has at least one address,
    /// or fail with a timeout for the zone.
    async fn ensure_glue(&self, zone: &Arc<NsZone>, depth: u8) -> Result<(), Error> {
        if zone.has_glue() {
            return Ok(());
        }

        debug!(zone = %zone.name(), "delegation without glue; resolving sibling nameservers");
        let _ = timeout(self.glue_deadline, self.fill_glue(zone, depth)).await;

        if zone.has_glue() {
            Ok(())
        } else {
            Err(Error::from(ErrorKind::Timeout).with_name(zone.name()))
        }
    }

    /// Fan out A (and AAAA, when enabled) lookups for every glueless NS
    /// that lives outside the zone being delegated.
    async fn fill_glue(&self, zone: &Arc<NsZone>, depth: u8) {
        let mut targets = Vec::new();
        zone.for_each_ns(|ns, addrs| {
            // an in-bailiwick NS without glue cannot be resolved without
            // first talking to the very zone being delegated
            if addrs.is_empty() && !zone.name().zone_of(ns) {
                targets.push(ns.clone());
            }
        });

        let mut rtypes = vec![RecordType::A];
        if self.aaaa_enabled {
            rtypes.push(RecordType::AAAA);
        }

        let mut lookups = FuturesUnordered::new();
        for target in targets {
            for rtype in &rtypes {
                let engine = self.clone();
                let target = target.clone();
                let rtype = *rtype;
                lookups.push(async move {
                    let mut visited = Vec::new();
                    let outcome = engine
                        .resolve(Query::query(target.clone(), rtype), depth + 1, &mut visited)
                        .await;
                    (target, outcome)
                });
            }
        }

        while let Some((target, outcome)) = lookups.next().await {
            match outcome {
                Ok(response) => {
                    let addrs: Vec<IpAddr> = response
                        .answers()
                        .iter()
                        .filter_map(record_ip)
                        .filter(|addr| self.family_allowed(*addr))
                        .collect();
                    if !addrs.is_empty() {
                        zone.add_glue(&target, &addrs);
                    }
                }
                Err(err) => {
                    debug!(ns = %target, %err, "sibling nameserver lookup failed");
                }
            }
        }
    }

    /// Restart resolution at a CNAME target and merge what comes back into
    /// the response already in hand. A failed chase returns the pre-chase
    /// response, so callers still see the partial chain; a redirect to a
    /// name already visited, or a chain past the redirection limit, fails
    /// the whole lookup instead.
    async fn chase_cname(
        &self,
        mut response: Message,
        query: &Query,
        depth: u8,
        visited: &mut Vec<Name>,
    ) -> Result<Message, Error> {
        let target = {
            let Some(record) = first_answer_of(&response, RecordType::CNAME) else {
                return Err(Error::from(ErrorKind::BadResponse).with_name(query.name()));
            };
            match record.data() {
                RData::CNAME(cname) => canonicalize(cname.0.clone()),
                _ => return Err(Error::from(ErrorKind::BadResponse).with_name(query.name())),
            }
        };

        if visited.contains(&target) {
            warn!(query = %query, cname = %target, "CNAME loop detected");
            return Err(Error::from(ErrorKind::CnameLoop).with_name(query.name()));
        }
        visited.push(target.clone());
        if visited.len() > usize::from(self.cname_limit) {
            warn!(
                query = %query,
                limit = self.cname_limit,
                "CNAME chain exceeded the redirection limit"
            );
            return Err(Error::from(ErrorKind::CnameChainExceeded {
                limit: self.cname_limit,
            })
            .with_name(query.name()));
        }

        let mut sub_query = Query::query(target, query.query_type());
        sub_query.set_query_class(query.query_class());

        match self.resolve(sub_query, depth + 1, visited).await {
            Ok(mut chased) => {
                response.answers_mut().extend(chased.take_answers());
                response
                    .name_servers_mut()
                    .extend(chased.take_name_servers());
                response.additionals_mut().extend(
                    chased
                        .take_additionals()
                        .into_iter()
                        .filter(|rr| {
                            matches!(rr.record_type(), RecordType::A | RecordType::AAAA)
                        }),
                );
                Ok(response)
            }
            // loop diagnostics fail the whole chain, not just this hop
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::CnameLoop | ErrorKind::CnameChainExceeded { .. }
                ) =>
            {
                Err(err)
            }
            Err(err) => {
                debug!(query = %query, %err, "CNAME chase failed; returning partial chain");
                Ok(response)
            }
        }
    }
}

#[async_trait]
impl<C: Client + 'static> Exchanger for Delver<C> {
    /// Resolve a pre-formed request iteratively.
    ///
    /// The first question is copied into fresh, sanitized requests (new
    /// transaction ids, recursion-desired off, this engine's EDNS defaults)
    /// for each pass; the response carries the original request id. EDNS
    /// client-subnet options are not preserved across the walk; this is a
    /// known limitation.
    async fn exchange(&self, request: Message) -> Result<Message, Error> {
        let Some(query) = request.queries().first() else {
            // nothing to answer
            return Ok(reply_to(&request));
        };

        let mut query = query.clone();
        query.set_name(canonicalize(query.name().clone()));

        let mut visited = Vec::new();
        let mut response = self.resolve(query, 0, &mut visited).await?;
        response.set_id(request.id());
        Ok(response)
    }
}
