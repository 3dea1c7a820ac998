//! Status tracking and status-page aggregation.

mod page;
mod tracker;

pub use page::*;
pub use tracker::*;
