mod controller;
mod dispatcher;
mod engine;
mod error;
mod events;
mod guest;
mod identity;
mod probe;
mod traits;
mod types;

#[cfg(test)]
mod testing;

pub use controller::*;
pub use dispatcher::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use guest::*;
pub use identity::*;
pub use probe::*;
pub use traits::*;
pub use types::*;
