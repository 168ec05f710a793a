//! Framing negotiation for `auto` stdio servers.
//!
//! Framing cannot change on a live connection, so each candidate gets its own
//! process and decoder. This module only tracks which candidate is current;
//! the client does the spawning.

use super::errors::FailureReason;
use super::framing::Framing;

/// Candidate order when the configured framing is `auto`.
const AUTO_CANDIDATES: [Framing; 2] = [Framing::LengthPrefixed, Framing::Newline];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Restart with this framing.
    Retry(Framing),
    /// No candidates left, or the failure makes further candidates pointless.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct Negotiation {
    candidates: Vec<Framing>,
    index: usize,
}

impl Negotiation {
    pub fn new(configured: Framing) -> Self {
        let candidates = match configured {
            Framing::Auto => AUTO_CANDIDATES.to_vec(),
            fixed => vec![fixed],
        };
        Self {
            candidates,
            index: 0,
        }
    }

    /// Framing for the current attempt.
    pub fn current(&self) -> Option<Framing> {
        self.candidates.get(self.index).copied()
    }

    /// The current candidate failed with `reason`.
    pub fn fail(&mut self, reason: FailureReason) -> NextStep {
        // A missing executable fails the same way under every framing.
        if reason == FailureReason::SpawnFailed || reason == FailureReason::ShuttingDown {
            self.index = self.candidates.len();
            return NextStep::GiveUp;
        }
        self.index += 1;
        match self.current() {
            Some(next) => NextStep::Retry(next),
            None => NextStep::GiveUp,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
