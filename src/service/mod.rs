//! Service domain model: discovered instances, filters, and registration options.

mod filter;
mod model;
mod options;

pub use filter::{ANY_DATACENTER, Filter};
pub use model::{MAX_WEIGHT, Service, Status, datacenter_from_tags, sort_by_id, weight_by_tags};
pub use options::{CheckInfo, Options};
