pub mod health;
pub mod path;
pub mod proxy;
pub mod status;

pub use health::{health_check, metrics_endpoint, readiness_check};
pub use path::{session_route, MalformedSessionPath, Route};
pub use proxy::proxy;
pub use status::{get_session, list_sessions};
