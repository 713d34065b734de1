//! Error types for the crate.

use std::{fmt, net::SocketAddr};

use enum_as_inner::EnumAsInner;
use hickory_proto::{
    op::{Message, ResponseCode},
    rr::Name,
    ProtoError,
};
use thiserror::Error;

/// The kind of error that occurred during resolution.
///
/// This is a closed taxonomy: callers branch on kinds (or on the
/// [`Error::is_timeout`]-style classifiers), not on message strings.
#[derive(Debug, Clone, EnumAsInner, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The caller handed us something unusable: no question, empty name.
    #[error("invalid request")]
    BadRequest,

    /// The request asks for something the resolver does not support.
    #[error("not implemented")]
    NotImplemented,

    /// The upstream server returned an unexpected shape: success with no
    /// answers, no referral, and no SOA.
    #[error("bad response from upstream server")]
    BadResponse,

    /// The response had the TC bit set. Retriable over TCP by a wrapping
    /// client; the core does not retry.
    #[error("response was truncated")]
    Truncated,

    /// No response message came back at all.
    #[error("no answer from upstream server")]
    NoAnswer,

    /// Authoritative denial: the name does not exist.
    #[error("name does not exist")]
    NxDomain,

    /// The name exists but has no records of the requested type.
    #[error("no records of the requested type")]
    NoData,

    /// A deadline elapsed during an exchange or a sub-resolution.
    #[error("request timed out")]
    Timeout,

    /// The caller abandoned the request.
    #[error("request was cancelled")]
    Cancelled,

    /// No cached delegation covers the queried name.
    #[error("no authoritative zone available")]
    Refused,

    /// A zone failed validation and cannot be cached.
    #[error("invalid delegation zone")]
    InvalidZone,

    /// A CNAME redirected to a name already visited in this chain.
    #[error("CNAME loop detected")]
    CnameLoop,

    /// A CNAME chain kept going past the redirection limit.
    #[error("CNAME chain exceeded {limit} redirections")]
    CnameChainExceeded {
        /// The configured redirection limit.
        limit: u8,
    },

    /// The delegation walk did not terminate within the pass budget.
    #[error("delegation walk exceeded {limit} passes")]
    PassLimitExceeded {
        /// The configured pass budget.
        limit: usize,
    },

    /// Sub-resolution nested deeper than allowed.
    #[error("recursion depth exceeded at {depth}")]
    RecursionExceeded {
        /// The depth at which the limit tripped.
        depth: u8,
    },

    /// The server answered with a response code we do not handle.
    #[error("unexpected response code {0:?}")]
    Rcode(ResponseCode),

    /// An invariant broke. Callers see this as a server failure.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// An error from the proto layer (parsing, serialization, names).
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),

    /// An error with an arbitrary static message.
    #[error("{0}")]
    Message(&'static str),

    /// An error with an arbitrary owned message.
    #[error("{0}")]
    Msg(String),
}

/// The error type for resolution failures.
///
/// Carries the kind plus whatever context was known where the failure
/// surfaced: the queried name and the server that was being asked.
#[derive(Debug, Clone, Error)]
pub struct Error {
    kind: Box<ErrorKind>,
    name: Option<Name>,
    server: Option<SocketAddr>,
}

impl Error {
    /// The kind of error that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The name being resolved when the error surfaced, if known.
    pub fn name(&self) -> Option<&Name> {
        self.name.as_ref()
    }

    /// The server being queried when the error surfaced, if known.
    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    /// Attach the queried name, keeping an already-recorded one.
    pub fn with_name(mut self, name: &Name) -> Self {
        if self.name.is_none() {
            self.name = Some(name.clone());
        }
        self
    }

    /// Attach the queried server, keeping an already-recorded one.
    pub fn with_server(mut self, server: SocketAddr) -> Self {
        if self.server.is_none() {
            self.server = Some(server);
        }
        self
    }

    /// True if a deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(*self.kind, ErrorKind::Timeout)
    }

    /// True if retrying later (or over another transport) could succeed.
    pub fn is_temporary(&self) -> bool {
        matches!(
            *self.kind,
            ErrorKind::Truncated
                | ErrorKind::NoAnswer
                | ErrorKind::Timeout
                | ErrorKind::BadResponse
        )
    }

    /// True if the name, or the requested type at that name, does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(*self.kind, ErrorKind::NxDomain | ErrorKind::NoData)
    }

    /// True for an authoritative "no such name" denial.
    pub fn is_nx_domain(&self) -> bool {
        matches!(*self.kind, ErrorKind::NxDomain)
    }

    /// True for an authoritative empty answer for the requested type.
    pub fn is_no_data(&self) -> bool {
        matches!(*self.kind, ErrorKind::NoData)
    }

    /// Classify a response message, returning the matching error if it is
    /// one of the failure shapes.
    ///
    /// `None` means the message is usable: either it carries answers, or it
    /// is a non-authoritative success (a referral, typically).
    pub fn from_response(response: &Message) -> Option<Self> {
        let name = response.queries().first().map(|q| q.name().clone());

        if response.truncated() {
            return Some(Self {
                kind: Box::new(ErrorKind::Truncated),
                name,
                server: None,
            });
        }

        let kind = match response.response_code() {
            ResponseCode::NoError => {
                if response.answers().is_empty() && response.authoritative() {
                    ErrorKind::NoData
                } else {
                    return None;
                }
            }
            ResponseCode::NXDomain => ErrorKind::NxDomain,
            rcode => ErrorKind::Rcode(rcode),
        };

        Some(Self {
            kind: Box::new(kind),
            name,
            server: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)?;
        if let Some(name) = &self.name {
            write!(f, " (name: {name}")?;
            if let Some(server) = self.server {
                write!(f, ", server: {server}")?;
            }
            write!(f, ")")?;
        } else if let Some(server) = self.server {
            write!(f, " (server: {server})")?;
        }
        Ok(())
    }
}

impl<E> From<E> for Error
where
    E: Into<ErrorKind>,
{
    fn from(error: E) -> Self {
        Self {
            kind: Box::new(error.into()),
            name: None,
            server: None,
        }
    }
}

impl From<&'static str> for Error {
    fn from(msg: &'static str) -> Self {
        ErrorKind::Message(msg).into()
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        ErrorKind::Msg(msg).into()
    }
}
