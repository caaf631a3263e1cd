mod args;
mod driver;
mod progress;
mod write;

pub use args::*;
pub use driver::{load_table, MZCorrelater, MZCorrelaterError};
pub use write::{GroupRecord, IdentityRecord, MemberRecord, NetworkRecord, ResultDocument, RowRecord};
