//! Gateway config generator: the declarative routing table consumed by the
//! reverse proxy. Regenerated whole on every run.

pub mod generate;
pub mod model;
pub mod write;

pub use generate::{GatewayGenerator, Generated, REACHABILITY_TIMEOUT};
pub use model::{Consumer, Credential, GatewayDocument, GatewayService, Plugin, Route};
pub use write::{validate, write};
