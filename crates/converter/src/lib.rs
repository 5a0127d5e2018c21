pub mod config;
pub mod item;
pub mod scan;
pub mod sidecar;
pub mod shell;
pub mod error;
pub mod exec;
pub mod transfer;
pub mod capability;
pub mod session;
pub mod workspace;
pub mod orchestrator;
pub mod summary;

pub use config::{ConvertConfig, Transport};
pub use error::RunError;
pub use item::{ItemStatus, Stage, WorkItem};
pub use orchestrator::{run_conversion, Orchestrator};
pub use scan::{scan_inventory, Inventory};
pub use session::{open_session, Session};
pub use summary::RunSummary;
