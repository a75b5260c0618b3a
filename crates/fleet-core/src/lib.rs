pub mod config;
pub mod flavor;
pub mod types;

pub use config::FleetConfig;
pub use flavor::{Flavor, FlavorCatalog, FlavorError, FlavorKind, FlavorMatch, Resources};
pub use types::*;
