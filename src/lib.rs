pub mod aggregator;
pub mod environment;
pub mod feed;
pub mod logging;
pub mod poller;

pub use aggregator::{AlertProvider, Aggregator};
pub use feed::{AlertRecord, Severity, SourceDescriptor, SourceKind};
pub use poller::{AlertSnapshot, Poller, Subscription};

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_FEED: &str = "feed";
pub const TARGET_POLLER: &str = "poller";
