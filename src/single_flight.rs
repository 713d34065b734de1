//! Single-flight deduplication of wire exchanges.
//!
//! Concurrent exchanges that serialize to the same request (transaction id
//! aside) against the same server share one wire round trip. The first
//! caller becomes the leader and drives the exchange; followers await the
//! same shared future and receive a copy of the leader's response with
//! their own transaction id written back in.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures_util::future::{FutureExt, Shared};
use hickory_proto::op::Message;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    client::Client,
    error::Error,
    msg::{fresh_id, reply_to},
};

/// How long a completed exchange stays answerable from the flight table.
pub const DEFAULT_SINGLE_FLIGHT_EXPIRY: Duration = Duration::from_secs(1);

/// Post-completion retention policy for single-flight keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiry {
    /// Hold completed results for [`DEFAULT_SINGLE_FLIGHT_EXPIRY`].
    #[default]
    Default,
    /// Forget a key the moment its exchange completes.
    Immediate,
    /// Hold completed results for the given duration.
    After(Duration),
}

impl Expiry {
    fn hold(self) -> Option<Duration> {
        match self {
            Self::Default => Some(DEFAULT_SINGLE_FLIGHT_EXPIRY),
            Self::Immediate => None,
            Self::After(d) if d.is_zero() => None,
            Self::After(d) => Some(d),
        }
    }
}

type ExchangeResult = Result<(Message, Duration), Error>;
type SharedExchange = Shared<Pin<Box<dyn Future<Output = ExchangeResult> + Send>>>;
type Flights = Mutex<HashMap<Vec<u8>, SharedExchange>>;

/// A deduplicating [`Client`] wrapper.
///
/// Keys are the packed request with its id cleared, concatenated with the
/// server address, so identical logical queries collapse regardless of
/// their transaction ids.
pub struct SingleFlight<C> {
    client: Arc<C>,
    flights: Arc<Flights>,
    expiry: Expiry,
}

impl<C> SingleFlight<C> {
    /// Wrap a client, holding completed results per `expiry`.
    pub fn new(client: C, expiry: Expiry) -> Self {
        Self {
            client: Arc::new(client),
            flights: Arc::new(Mutex::new(HashMap::new())),
            expiry,
        }
    }

    /// Number of keys currently tracked, in flight or held after completion.
    pub fn len(&self) -> usize {
        self.flights.lock().len()
    }

    /// True when no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.flights.lock().is_empty()
    }
}

impl<C: Client + 'static> SingleFlight<C> {
    fn join_flight(&self, key: Vec<u8>, request: Message, server: SocketAddr) -> (SharedExchange, bool) {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get(&key) {
            trace!(%server, "joining in-flight exchange");
            return (flight.clone(), false);
        }

        let client = self.client.clone();
        let registry = self.flights.clone();
        let expiry = self.expiry;
        let forget_key = key.clone();

        let flight: SharedExchange = async move {
            let result = client.exchange(request, server).await;
            match expiry.hold() {
                Some(delay) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        registry.lock().remove(&forget_key);
                    });
                }
                None => {
                    registry.lock().remove(&forget_key);
                }
            }
            result
        }
        .boxed()
        .shared();

        flights.insert(key, flight.clone());
        (flight, true)
    }
}

/// The packed request (id cleared) concatenated with the server address.
fn request_key(request: &Message, server: SocketAddr) -> Result<Vec<u8>, Error> {
    let mut scratch = request.clone();
    scratch.set_id(0);
    let mut key = scratch.to_vec()?;
    key.extend_from_slice(server.to_string().as_bytes());
    Ok(key)
}

#[async_trait]
impl<C: Client + 'static> Client for SingleFlight<C> {
    async fn exchange(
        &self,
        mut request: Message,
        server: SocketAddr,
    ) -> Result<(Message, Duration), Error> {
        match request.queries().len() {
            // nothing to ask: synthesize an empty reply, skip the wire
            0 => return Ok((reply_to(&request), Duration::ZERO)),
            1 => {}
            // shrink to the first question
            _ => {
                let first = request.queries()[0].clone();
                request.take_queries();
                request.add_query(first);
            }
        }

        if request.id() == 0 {
            request.set_id(fresh_id());
        }
        let id = request.id();

        let key = request_key(&request, server)?;
        let (flight, leader) = self.join_flight(key, request, server);

        // every awaiter of the shared future gets its own clone of the
        // leader's result; followers restore their transaction id
        let (mut response, rtt) = flight.await?;
        if !leader {
            response.set_id(id);
        }
        Ok((response, rtt))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hickory_proto::{
        op::{Query, ResponseCode},
        rr::{Name, RecordType},
    };

    use crate::msg::new_request;

    use super::*;

    struct CountingClient {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingClient {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Client for CountingClient {
        async fn exchange(
            &self,
            request: Message,
            _server: SocketAddr,
        ) -> Result<(Message, Duration), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut response = reply_to(&request);
            response.set_response_code(ResponseCode::NoError);
            Ok((response, Duration::from_millis(1)))
        }
    }

    fn server() -> SocketAddr {
        "192.0.2.53:53".parse().unwrap()
    }

    fn request_for(name: &str, id: u16) -> Message {
        let query = Query::query(Name::from_ascii(name).unwrap(), RecordType::A);
        let mut request = new_request(query, 4096);
        request.set_id(id);
        request
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_exchange() {
        let wire = Arc::new(CountingClient::new(Duration::from_millis(50)));
        let flight = SingleFlight::new(wire.clone(), Expiry::Immediate);

        let (a, b) = tokio::join!(
            flight.exchange(request_for("dup.testing.", 11), server()),
            flight.exchange(request_for("dup.testing.", 22), server()),
        );

        let (resp_a, _) = a.unwrap();
        let (resp_b, _) = b.unwrap();
        assert_eq!(wire.calls(), 1);

        // each caller sees its own transaction id
        let ids = [resp_a.id(), resp_b.id()];
        assert!(ids.contains(&11));
        assert!(ids.contains(&22));
    }

    #[tokio::test]
    async fn different_servers_do_not_collapse() {
        let wire = Arc::new(CountingClient::new(Duration::from_millis(10)));
        let flight = SingleFlight::new(wire.clone(), Expiry::Immediate);
        let other: SocketAddr = "192.0.2.54:53".parse().unwrap();

        let (a, b) = tokio::join!(
            flight.exchange(request_for("spread.testing.", 1), server()),
            flight.exchange(request_for("spread.testing.", 2), other),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(wire.calls(), 2);
    }

    #[tokio::test]
    async fn held_results_answer_again_without_the_wire() {
        let wire = Arc::new(CountingClient::new(Duration::ZERO));
        let flight = SingleFlight::new(wire.clone(), Expiry::After(Duration::from_secs(30)));

        flight
            .exchange(request_for("held.testing.", 5), server())
            .await
            .unwrap();
        let (resp, _) = flight
            .exchange(request_for("held.testing.", 6), server())
            .await
            .unwrap();

        assert_eq!(wire.calls(), 1);
        assert_eq!(resp.id(), 6);
    }

    #[tokio::test]
    async fn immediate_expiry_forgets_completed_keys() {
        let wire = Arc::new(CountingClient::new(Duration::ZERO));
        let flight = SingleFlight::new(wire.clone(), Expiry::Immediate);

        flight
            .exchange(request_for("gone.testing.", 1), server())
            .await
            .unwrap();
        assert!(flight.is_empty());

        flight
            .exchange(request_for("gone.testing.", 2), server())
            .await
            .unwrap();
        assert_eq!(wire.calls(), 2);
    }

    #[tokio::test]
    async fn empty_question_list_replies_without_the_wire() {
        let wire = Arc::new(CountingClient::new(Duration::ZERO));
        let flight = SingleFlight::new(wire.clone(), Expiry::Default);

        let mut request = Message::new();
        request.set_id(77);
        let (response, rtt) = flight.exchange(request, server()).await.unwrap();

        assert_eq!(response.id(), 77);
        assert!(response.answers().is_empty());
        assert_eq!(rtt, Duration::ZERO);
        assert_eq!(wire.calls(), 0);
    }

    #[tokio::test]
    async fn extra_questions_are_dropped() {
        let wire = Arc::new(CountingClient::new(Duration::ZERO));
        let flight = SingleFlight::new(wire.clone(), Expiry::Immediate);

        let mut request = request_for("first.testing.", 9);
        request.add_query(Query::query(
            Name::from_ascii("second.testing.").unwrap(),
            RecordType::AAAA,
        ));

        let (response, _) = flight.exchange(request, server()).await.unwrap();
        assert_eq!(response.queries().len(), 1);
        assert_eq!(
            response.queries()[0].name().to_ascii(),
            "first.testing."
        );
    }
}
