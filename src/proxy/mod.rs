pub mod context;
pub mod filter;

pub use context::{RequestContext, StoredRequest, StoredResponse, Value};
pub use filter::{Filter, FilterFlow};
