pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod translate;
pub mod upstream;

pub use config::BridgeConfig;
pub use error::{BridgeError, NormalizedError, Result};
pub use logging::SharedEventLog;
pub use server::{build_router, AppState};
pub use upstream::{HttpTransport, Transport, UpstreamClient};
