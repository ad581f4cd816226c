use crate::domain::transaction::TransactionRequest;
use crate::error::{Result, SettlementError};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};

/// One line of a replay file. Later commands address the transaction through
/// its `order_id`, since transaction ids are generated on initiation.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Initiate {
        request: TransactionRequest,
    },
    ConfirmDelivery {
        order_id: String,
        #[serde(default)]
        confirmation_id: Option<String>,
        #[serde(default)]
        confirmed_by: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },
    Refund {
        order_id: String,
        reason: String,
    },
    Dispute {
        order_id: String,
        reason: String,
        initiated_by: String,
        #[serde(default)]
        evidence: Vec<String>,
    },
    Resume {
        order_id: String,
    },
}

impl Command {
    pub fn order_id(&self) -> &str {
        match self {
            Command::Initiate { request } => &request.order_id,
            Command::ConfirmDelivery { order_id, .. }
            | Command::Refund { order_id, .. }
            | Command::Dispute { order_id, .. }
            | Command::Resume { order_id } => order_id,
        }
    }
}

/// Streams commands from newline-delimited JSON. Blank lines and lines
/// starting with `#` are skipped; a malformed line yields an error item and
/// reading continues with the next one.
pub struct CommandReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: BufReader::new(source),
        }
    }

    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .lines()
            .enumerate()
            .filter_map(|(index, line)| match line {
                Err(e) => Some(Err(SettlementError::from(e))),
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        return None;
                    }
                    Some(serde_json::from_str(trimmed).map_err(|e| {
                        SettlementError::Validation(format!("line {}: {}", index + 1, e))
                    }))
                }
            })
    }
}
