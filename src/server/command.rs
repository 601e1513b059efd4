//! Request tokens understood by the query server.

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Report the current standing of every tracking period.
    Status,
    /// Recognized, but there is nothing to report. Consumed without a reply.
    Info,
    /// Anything else. Consumed without a reply.
    Unknown(String),
}

impl Command {
    /// Decode one frame (delimiter already stripped).
    pub fn parse(frame: &[u8]) -> Self {
        let token = String::from_utf8_lossy(frame);
        match token.trim() {
            "status" => Command::Status,
            "info" => Command::Info,
            other => Command::Unknown(other.to_string()),
        }
    }
}
