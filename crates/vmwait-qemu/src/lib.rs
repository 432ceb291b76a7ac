mod dirs;
mod error;
mod guest_agent;
mod inventory;
mod plane;
mod qmp;
mod settings;

pub use self::dirs::*;
pub use error::*;
pub use guest_agent::*;
pub use inventory::*;
pub use plane::*;
pub use qmp::*;
pub use settings::*;
