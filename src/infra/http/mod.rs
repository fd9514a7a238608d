pub mod connections;
mod middleware;
mod public;
mod server;
pub mod session;

pub use connections::ConnectionCounter;
pub use middleware::RequestContext;
pub use public::{HttpState, build_router};
pub use server::serve;
pub use session::CookieSessions;
