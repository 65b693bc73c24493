pub mod driver;
pub mod entry;
pub mod handle;

pub use driver::{DriverOptions, DriverSnapshot, OplogObserveDriver, Phase};
pub use entry::{OpKind, OplogEntry};
pub use handle::{ListenerHandle, OplogHandle, OplogNotification, Trigger};
