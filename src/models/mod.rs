pub mod diagnostics;
pub mod error;
pub mod flow;
pub mod health;
pub mod messages;
pub mod presence;
pub mod snapshot;
pub mod user;

pub use diagnostics::*;
pub use error::*;
pub use flow::*;
pub use health::*;
pub use messages::*;
pub use presence::*;
pub use snapshot::*;
pub use user::*;
