pub mod allowlist;
pub mod cdp;
pub mod chrome;
pub mod command;
pub mod driver;
pub mod locator;
pub mod sandbox;
pub mod snapshot;

pub use chrome::ChromeLauncher;
pub use command::{Assertion, Command};
pub use driver::{BrowserLauncher, LoadState, PageDriver};
pub use locator::{ElementAction, Locator, LocatorStep, WaitState};
pub use sandbox::{CommandSandbox, ExecutionResult, ExecutionSandbox};
pub use snapshot::{summarize, SemanticNode, SnapshotBuilder, SnapshotOptions};
