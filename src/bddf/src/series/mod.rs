mod descriptor;
mod registry;

pub use descriptor::*;
pub use registry::*;
