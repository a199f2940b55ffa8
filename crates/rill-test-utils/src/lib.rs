//! Test doubles and harness helpers shared by the service and workspace
//! integration suites.

pub mod mock_agent;
pub mod test_server;

pub use mock_agent::MockAgent;
pub use test_server::TestServer;
