//! Check definitions, validation and the active-definition registry.

mod de;
mod definition;
mod registry;
mod status_codes;

pub use definition::*;
pub use registry::*;
pub use status_codes::*;
