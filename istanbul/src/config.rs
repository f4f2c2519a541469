use crate::validators::QuorumFormula;
use std::time::Duration;

/// Protocol variant used to finalize a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Ibft,
    Qbft,
}

/// Parameter overrides that take effect at a block height.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// First sequence the overrides apply to.
    pub block: u64,

    /// Protocol variant to switch to.
    pub algorithm: Option<Algorithm>,

    /// Base round-change timeout to switch to.
    pub request_timeout: Option<Duration>,
}

/// Parameters in effect at a given sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Params {
    pub algorithm: Algorithm,
    pub request_timeout: Duration,
    pub quorum: QuorumFormula,
}

/// Configuration for the consensus engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of messages to buffer in the engine mailbox before blocking.
    pub mailbox_size: usize,

    /// Maximum number of future messages to keep for each validator.
    pub backlog_size: usize,

    /// Base amount of time to wait for a round to complete before broadcasting
    /// ROUND-CHANGE.
    ///
    /// The timeout of round `r` is `request_timeout * 2^r`.
    pub request_timeout: Duration,

    /// First sequence at which quorums are computed as `ceil(2N/3)` instead of `2F+1`.
    ///
    /// If `None`, `2F+1` is always used.
    pub ceil2nby3_block: Option<u64>,

    /// First sequence finalized with QBFT.
    ///
    /// If `None`, the variant is selected by `transitions` (IBFT by default).
    pub qbft_block: Option<u64>,

    /// Height-indexed overrides, sorted by block.
    pub transitions: Vec<Transition>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mailbox_size: 1024,
            backlog_size: 1024,
            request_timeout: Duration::from_secs(10),
            ceil2nby3_block: None,
            qbft_block: Some(0),
            transitions: Vec::new(),
        }
    }
}

impl Config {
    /// Assert enforces that all configuration values are valid.
    pub fn assert(&self) {
        assert!(self.mailbox_size > 0, "mailbox size must be greater than zero");
        assert!(self.backlog_size > 0, "backlog size must be greater than zero");
        assert!(
            self.request_timeout > Duration::default(),
            "request timeout must be greater than zero"
        );
        for window in self.transitions.windows(2) {
            assert!(
                window[0].block < window[1].block,
                "transitions must be sorted by strictly increasing block"
            );
        }
        for transition in &self.transitions {
            if let Some(timeout) = transition.request_timeout {
                assert!(
                    timeout > Duration::default(),
                    "transition request timeout must be greater than zero"
                );
            }
        }

        // The variant used at genesis must be unambiguous
        if let Some(genesis) = self.transitions.first().filter(|t| t.block == 0) {
            if let (Some(algorithm), Some(qbft_block)) = (genesis.algorithm, self.qbft_block) {
                let selected = if qbft_block == 0 {
                    Algorithm::Qbft
                } else {
                    Algorithm::Ibft
                };
                assert_eq!(algorithm, selected, "conflicting algorithms at genesis");
            }
        }
    }

    /// Protocol variant used to finalize `sequence`.
    pub fn algorithm_at(&self, sequence: u64) -> Algorithm {
        if matches!(self.qbft_block, Some(block) if sequence >= block) {
            return Algorithm::Qbft;
        }
        self.transitions
            .iter()
            .take_while(|t| t.block <= sequence)
            .filter_map(|t| t.algorithm)
            .last()
            .unwrap_or(Algorithm::Ibft)
    }

    /// Base round-change timeout in effect at `sequence`.
    pub fn request_timeout_at(&self, sequence: u64) -> Duration {
        self.transitions
            .iter()
            .take_while(|t| t.block <= sequence)
            .filter_map(|t| t.request_timeout)
            .last()
            .unwrap_or(self.request_timeout)
    }

    /// Quorum formula in effect at `sequence`.
    ///
    /// Sequences strictly below `ceil2nby3_block` use `2F+1`.
    pub fn quorum_at(&self, sequence: u64) -> QuorumFormula {
        match self.ceil2nby3_block {
            Some(block) if sequence >= block => QuorumFormula::Ceil,
            _ => QuorumFormula::Legacy,
        }
    }

    /// All parameters in effect at `sequence`.
    pub fn at(&self, sequence: u64) -> Params {
        Params {
            algorithm: self.algorithm_at(sequence),
            request_timeout: self.request_timeout_at(sequence),
            quorum: self.quorum_at(sequence),
        }
    }
}
