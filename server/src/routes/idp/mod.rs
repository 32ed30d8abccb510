//! Routes that drive the login round trip with the identity provider and manage the
//! resulting session.

mod callback;
mod exchange;
mod login;
mod logout;
mod refresh;

pub use callback::*;
pub use exchange::*;
pub use login::*;
pub use logout::*;
pub use refresh::*;
