pub mod demo;
pub mod manager;
pub mod state;
pub mod supervisor;

pub use demo::{run_demo, DemoExit, RandomWalk, DEMO_TICK};
pub use manager::{decide, ConnectionManager, Decision, StreamEnd};
pub use state::{ConnectionState, LinkPhase, LinkState};
pub use supervisor::{backoff_delay, supervise, supervise_with, Supervisor};
