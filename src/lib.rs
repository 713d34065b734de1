//! An iterative DNS resolver core.
//!
//! `delver` answers a DNS question by walking the delegation tree itself:
//! starting from the root hints it follows referrals downward, caching every
//! NS delegation (and its glue) it learns on the way, until it reaches a
//! server authoritative for the queried name. Only delegations are cached;
//! final answers are the caller's business.
//!
//! The crate owns no sockets. The wire is an injected [`Client`] capability,
//! and everything above it (the [`SingleFlight`] deduplicator, the
//! [`NsCache`] delegation cache, and the [`Delver`] engine) is transport
//! agnostic.
//!
//! ```no_run
//! use delver::{DelverBuilder, Exchanger};
//! use hickory_proto::rr::{Name, RecordType};
//!
//! # async fn example(wire: impl delver::Client + 'static) -> Result<(), delver::Error> {
//! let delver = DelverBuilder::new().build(wire)?;
//! let response = delver
//!     .lookup(Name::from_ascii("example.com.")?, RecordType::A)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::unimplemented,
    missing_copy_implementations,
    missing_docs,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    unreachable_pub
)]
#![recursion_limit = "2048"]

use async_trait::async_trait;
use hickory_proto::{
    op::Message,
    rr::{Name, RecordType},
};

pub mod cache;
pub mod client;
pub mod delver;
pub mod error;
mod hints;
mod msg;
pub mod single_flight;
pub mod zone;


pub use cache::NsCache;
pub use client::{Client, ExchangeFn};
pub use delver::{Delver, DelverBuilder};
pub use error::{Error, ErrorKind};
pub use hints::ROOT_HINTS_TTL;
pub use msg::canonical_name;
pub use single_flight::{Expiry, SingleFlight};
pub use zone::{NsZone, MINIMUM_NS_TTL};

/// Something that can answer DNS questions.
///
/// There is one canonical shape: [`Exchanger::exchange`] takes a pre-formed
/// request. [`Exchanger::lookup`] is expressible in terms of it and comes
/// with a default body that builds an INET question from its parts;
/// implementors override whichever is natural for them.
#[async_trait]
pub trait Exchanger: Send + Sync {
    /// Resolve a pre-formed request message.
    async fn exchange(&self, request: Message) -> Result<Message, Error>;

    /// Resolve a question given by name and record type, in the INET class.
    ///
    /// The name is canonicalized (lowercased, fully qualified) before use.
    async fn lookup(&self, name: Name, rtype: RecordType) -> Result<Message, Error> {
        let name = msg::canonicalize(name);
        self.exchange(msg::query_message(name, rtype)).await
    }
}
