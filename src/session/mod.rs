// ABOUTME: Session module: registry, per-session input routing, and output framing.
// ABOUTME: A session pairs one model process with a FIFO writer and a response aggregator.

pub mod aggregator;
pub mod registry;
pub mod router;
pub mod types;

pub use registry::{Session, SessionFactory, SessionRegistry};
pub use router::{InputRouter, QueryTicket};
pub use types::{Query, Response, SessionEvent, SessionState, SessionStatus};
