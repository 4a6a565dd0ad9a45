mod gateway;
mod identity;
mod notifier;
mod pagination;
mod repository;

pub use gateway::*;
pub use identity::*;
pub use notifier::*;
pub use pagination::*;
pub use repository::*;
