//! Row types returned by the [`super::Store`].

/// A single message appended to a mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub app_id: String,
    pub mailbox_id: String,
    pub side: String,
    pub phase: String,
    pub body: Vec<u8>,
    pub server_rx: f64,
    pub msg_id: String,
}

/// One of the two usage-record kinds, `result` is always one of
/// `happy|lonely|errory|scary|crowded|pruney`.
#[derive(Debug, Clone, PartialEq)]
pub struct Usage {
    pub started: f64,
    pub waiting_time: Option<f64>,
    pub total_time: f64,
    pub result: &'static str,
}

impl Usage {
    pub fn new(started: f64, waiting_time: Option<f64>, total_time: f64, result: &'static str) -> Self {
        Usage {
            started,
            waiting_time,
            total_time,
            result,
        }
    }
}

/// A completed (or aborted) transit relay pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitUsage {
    pub started: f64,
    pub total_time: f64,
    pub total_bytes: u64,
    pub result: &'static str,
}
