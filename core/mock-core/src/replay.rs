//! Replay state: the loaded script blocks, which of them have been used and
//! where the cursor stands.

use crate::fingerprint::{Fingerprint, Normalizer};
use crate::script::RequestBlock;
use crate::traffic::Response;

#[derive(Debug, Clone)]
struct Entry {
    block: RequestBlock,
    fingerprint: Fingerprint,
    /// Sequence number of the match that consumed this block.
    consumed_at: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayState {
    entries: Vec<Entry>,
    cursor: usize,
    matches: u64,
}

impl ReplayState {
    pub fn new(blocks: Vec<RequestBlock>, normalizer: Normalizer<'_>) -> Self {
        let entries = blocks
            .into_iter()
            .map(|block| Entry {
                fingerprint: normalizer.text(block.tag, &block.text),
                block,
                consumed_at: None,
            })
            .collect();
        Self {
            entries,
            cursor: 0,
            matches: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Index of the first unconsumed block.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.consumed_at.is_none())
            .count()
    }

    /// Finds the responses scripted for `fingerprint`.
    ///
    /// Ordinary requests take the earliest unconsumed block with an equal
    /// fingerprint and consume it. Enquiry-only requests never consume: they
    /// reuse an unconsumed match or, failing that, the most recently
    /// consumed one.
    pub fn take(&mut self, fingerprint: &Fingerprint, enquiry_only: bool) -> Option<Vec<Response>> {
        let unconsumed = (self.cursor..self.entries.len()).find(|&index| {
            let entry = &self.entries[index];
            entry.consumed_at.is_none() && entry.fingerprint == *fingerprint
        });

        if enquiry_only {
            let index = unconsumed.or_else(|| {
                self.entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.fingerprint == *fingerprint)
                    .filter_map(|(index, entry)| entry.consumed_at.map(|seq| (seq, index)))
                    .max()
                    .map(|(_, index)| index)
            })?;
            tracing::debug!(index, fingerprint = %fingerprint, "Reusing block for enquiry");
            return Some(self.entries[index].block.responses.clone());
        }

        let index = unconsumed?;
        self.matches += 1;
        self.entries[index].consumed_at = Some(self.matches);
        while self
            .entries
            .get(self.cursor)
            .is_some_and(|entry| entry.consumed_at.is_some())
        {
            self.cursor += 1;
        }
        tracing::debug!(
            index,
            cursor = self.cursor,
            fingerprint = %fingerprint,
            "Consumed script block"
        );
        Some(self.entries[index].block.responses.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RcConfig;
    use crate::script;
    use crate::traffic::RequestTag;
    use std::path::Path;

    fn state(text: &str, config: &RcConfig) -> ReplayState {
        let blocks = script::parse(text, Path::new("script")).unwrap();
        ReplayState::new(blocks, Normalizer::new(config))
    }

    fn fp(config: &RcConfig, text: &str) -> Fingerprint {
        Normalizer::new(config).text(RequestTag::CommandLine, text)
    }

    fn stdout(responses: Option<Vec<Response>>) -> Option<String> {
        responses.map(|responses| responses[0].text.clone())
    }

    const TWO_DATES: &str = "<-CMD:['date']\n->OUT:first\n<-CMD:['ls']\n->OUT:listing\n<-CMD:['date']\n->OUT:second\n";

    #[test]
    fn identical_requests_consume_blocks_in_order() {
        let config = RcConfig::empty();
        let mut replay = state(TWO_DATES, &config);
        let date = fp(&config, "['date']");

        assert_eq!(stdout(replay.take(&date, false)).as_deref(), Some("first"));
        assert_eq!(replay.cursor(), 1);
        assert_eq!(stdout(replay.take(&date, false)).as_deref(), Some("second"));
        assert_eq!(replay.cursor(), 1);
        assert!(replay.take(&date, false).is_none());
        assert_eq!(replay.remaining(), 1);
    }

    #[test]
    fn out_of_order_requests_still_match() {
        let config = RcConfig::empty();
        let mut replay = state(TWO_DATES, &config);

        assert_eq!(
            stdout(replay.take(&fp(&config, "['ls']"), false)).as_deref(),
            Some("listing")
        );
        assert_eq!(replay.cursor(), 0);
        assert_eq!(
            stdout(replay.take(&fp(&config, "['date']"), false)).as_deref(),
            Some("first")
        );
        assert_eq!(replay.cursor(), 2);
    }

    #[test]
    fn enquiries_reuse_without_consuming() {
        let config = RcConfig::empty();
        let mut replay = state(TWO_DATES, &config);
        let date = fp(&config, "['date']");

        assert_eq!(stdout(replay.take(&date, true)).as_deref(), Some("first"));
        assert_eq!(replay.remaining(), 3);

        replay.take(&date, false);
        replay.take(&date, false);
        assert_eq!(stdout(replay.take(&date, true)).as_deref(), Some("second"));
        assert_eq!(replay.remaining(), 1);
    }

    #[test]
    fn unknown_requests_do_not_match() {
        let config = RcConfig::empty();
        let mut replay = state(TWO_DATES, &config);
        assert!(replay.take(&fp(&config, "['whoami']"), false).is_none());
        assert!(replay.take(&fp(&config, "['whoami']"), true).is_none());
        assert_eq!(replay.cursor(), 0);
    }
}
