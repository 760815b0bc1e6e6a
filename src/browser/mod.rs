pub mod agent;
pub mod chrome;
pub mod element_monitor;
pub mod navigation;

pub use agent::ContentAgent;
pub use chrome::{ChromeBrowser, ChromePage};
pub use element_monitor::{ElementMonitor, MonitorDelta, MonitorSnapshot};
pub use navigation::{NavigationEvent, NavigationWatcher};
