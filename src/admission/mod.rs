//! Fixed-window admission control and its state.

mod controller;
mod key;
mod store;
mod sweeper;
mod window;

pub use controller::{AdmissionController, AdmissionStatus, Decision};
pub use key::{ClientKey, KeyExtractor, KeySource};
pub use store::SweepReport;
pub use sweeper::{Sweeper, SweeperHandle};
pub use window::{Clock, ClockPolicy, FixedWindow, ManualClock, SystemClock, Timestamp, WindowIndex};
