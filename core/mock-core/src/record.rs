//! Write-through record log.

use crate::error::Result;
use crate::script::{RequestBlock, ScriptWriter};
use crate::traffic::{Request, Response};
use std::path::Path;

/// Appends recorded traffic to the record file in arrival order.
///
/// Requests without information (empty text, kills) and responses without
/// information are never written. Without a record file the log only counts.
pub struct RecordLog {
    writer: Option<ScriptWriter>,
    last_number: u64,
    recorded: usize,
}

impl RecordLog {
    pub fn disabled() -> Self {
        Self {
            writer: None,
            last_number: 0,
            recorded: 0,
        }
    }

    pub fn create(path: &Path, numbered: bool) -> Result<Self> {
        Ok(Self {
            writer: Some(ScriptWriter::create(path, numbered)?),
            last_number: 0,
            recorded: 0,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Records `request` with its responses. Returns whether anything was
    /// written.
    pub fn record(&mut self, number: u64, request: &Request, responses: &[Response]) -> Result<bool> {
        if !request.has_info() {
            return Ok(false);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(false);
        };
        if number <= self.last_number {
            tracing::warn!(
                number,
                last = self.last_number,
                "Request number out of order; recording anyway"
            );
        }

        let block = RequestBlock {
            number,
            tag: request.tag(),
            text: request.text(),
            responses: responses
                .iter()
                .filter(|response| response.has_info())
                .cloned()
                .collect(),
        };
        writer.append(&block)?;
        self.last_number = self.last_number.max(number);
        self.recorded += 1;
        tracing::debug!(number, request = %block.description(), "Recorded traffic");
        Ok(true)
    }
}
