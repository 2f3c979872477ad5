//! Out-of-band signals carried as negative record lengths.

use std::fmt;

/// Reply to a poll while the channel is healthy.
pub const OK_MSG: &str = "2000 OK\n";
/// Reply to a poll once the channel has been told to terminate.
pub const TERM_MSG: &str = "2999 Terminate\n";
/// Reply to a status request, followed by an EOD.
pub const STATUS_MSG: &str = "Status OK\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// End of data stream, new data may follow
    EndOfData,
    /// End of data stream, poll for acknowledgment
    EodPoll,
    /// Send full status
    Status,
    /// Conversation terminated, peer wants to close
    Terminate,
    /// Request an acknowledgment
    Poll,
    /// Keep-alive
    Heartbeat,
    /// Keep-alive answer
    HbResponse,
    /// Prompt for input
    Prompt,
    /// Send UTC btime
    Btime,
    /// Stop current command
    Break,
    StartSelect,
    EndSelect,
    InvalidCmd,
    CmdFailed,
    CmdOk,
    CmdBegin,
    /// Any negative value outside the known table.
    Unknown(i32),
}

const SIGNAL_TABLE: [(Signal, i32, &str); 16] = [
    (Signal::EndOfData, -1, "BNET_EOD"),
    (Signal::EodPoll, -2, "BNET_EOD_POLL"),
    (Signal::Status, -3, "BNET_STATUS"),
    (Signal::Terminate, -4, "BNET_TERMINATE"),
    (Signal::Poll, -5, "BNET_POLL"),
    (Signal::Heartbeat, -6, "BNET_HEARTBEAT"),
    (Signal::HbResponse, -7, "BNET_HB_RESPONSE"),
    (Signal::Prompt, -8, "BNET_PROMPT"),
    (Signal::Btime, -9, "BNET_BTIME"),
    (Signal::Break, -10, "BNET_BREAK"),
    (Signal::StartSelect, -11, "BNET_START_SELECT"),
    (Signal::EndSelect, -12, "BNET_END_SELECT"),
    (Signal::InvalidCmd, -13, "BNET_INVALID_CMD"),
    (Signal::CmdFailed, -14, "BNET_CMD_FAILED"),
    (Signal::CmdOk, -15, "BNET_CMD_OK"),
    (Signal::CmdBegin, -16, "BNET_CMD_BEGIN"),
];

impl Signal {
    /// Decode a record length that is known to be negative.
    pub fn from_code(code: i32) -> Self {
        SIGNAL_TABLE
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(sig, _, _)| *sig)
            .unwrap_or(Signal::Unknown(code))
    }

    /// The value written in place of a record length.
    pub fn code(self) -> i32 {
        match self {
            Signal::Unknown(code) => code,
            known => SIGNAL_TABLE
                .iter()
                .find(|(sig, _, _)| *sig == known)
                .map(|(_, c, _)| *c)
                .unwrap_or(0),
        }
    }

    pub fn name(self) -> String {
        signal_name(self.code())
    }
}

/// Printable name of a signal value, `"Unknown sig N"` for values outside the table.
pub fn signal_name(code: i32) -> String {
    SIGNAL_TABLE
        .iter()
        .find(|(_, c, _)| *c == code)
        .map(|(_, _, name)| (*name).to_string())
        .unwrap_or_else(|| format!("Unknown sig {}", code))
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
