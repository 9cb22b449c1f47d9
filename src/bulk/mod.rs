pub mod response;
pub mod walker;

pub use response::{has_top_level_errors, BulkItemDetail, BulkResponse, PartitionClass};
pub use walker::{BulkAction, BulkEvent, BulkWalker};
