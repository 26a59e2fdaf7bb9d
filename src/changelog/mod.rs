//! Directory changelog intake: the feed, record validation, DN routing and
//! the polling ingestor.

pub mod dn;
pub mod ingestor;
pub mod source;
pub mod validation;

pub use ingestor::{ChangelogIngestor, CheckOutcome, UpdateSummary};
pub use source::{ChangelogSource, HttpChangelogSource, MemoryChangelogSource, RawAttribute, RawChangeRecord};
pub use validation::validate;
