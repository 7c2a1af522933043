use hsync_p2p::NodeHost;
use libhsync::StatusIndicator;
use log::*;
use serde_json::Value;

/// A [`NodeHost`] for the terminal: messages go to stdout, status and errors to the log.
pub struct ConsoleHost {
    name: String,
}

impl ConsoleHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl NodeHost for ConsoleHost {
    fn send(&self, message: Value) {
        println!("{message}");
    }

    fn status(&self, indicator: StatusIndicator) {
        info!("[{}] {indicator}", self.name);
    }

    fn error(&self, detail: &str) {
        error!("[{}] {detail}", self.name);
    }
}
