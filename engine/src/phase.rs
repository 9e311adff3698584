use std::collections::VecDeque;
use std::fmt;

/// Coarse read of where a session is in its conversation arc, derived from
/// the recent retrieval/response pattern. Feeds prompt assembly only; it
/// never gates behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CognitivePhase {
    Exploration,
    Exploitation,
    Crisis,
    Drift,
    Steady,
}

impl fmt::Display for CognitivePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CognitivePhase::Exploration => "exploration",
            CognitivePhase::Exploitation => "exploitation",
            CognitivePhase::Crisis => "crisis",
            CognitivePhase::Drift => "drift",
            CognitivePhase::Steady => "steady",
        };
        f.write_str(label)
    }
}

/// What one completed turn contributes to the phase read.
#[derive(Debug, Clone, Copy)]
pub struct TurnSignal {
    /// Memories retrieved for the turn, both lanes combined.
    pub retrieved: usize,
    /// Best retrieval score of the turn; low means novel ground.
    pub best_score: f32,
    /// Whether the turn ended in an error or partial response.
    pub errored: bool,
}

/// Rolling window over the last few turns of one session.
pub struct PhaseTracker {
    window: VecDeque<TurnSignal>,
    capacity: usize,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new(8)
    }
}

impl PhaseTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn observe(&mut self, signal: TurnSignal) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(signal);
    }

    /// Read the current phase.
    ///
    /// Ordering matters: errors dominate, then novelty, then familiarity.
    pub fn current(&self) -> CognitivePhase {
        if self.window.is_empty() {
            return CognitivePhase::Exploration;
        }

        let turns = self.window.len() as f32;
        let errors = self.window.iter().filter(|s| s.errored).count();
        if errors >= 2 {
            return CognitivePhase::Crisis;
        }

        let avg_retrieved =
            self.window.iter().map(|s| s.retrieved as f32).sum::<f32>() / turns;
        let avg_score = self.window.iter().map(|s| s.best_score).sum::<f32>() / turns;

        if avg_retrieved < 1.0 || avg_score < 0.35 {
            return CognitivePhase::Exploration;
        }
        if avg_score >= 0.7 {
            return CognitivePhase::Exploitation;
        }

        // Scores that swing hard between familiar and novel read as drift.
        let spread = self
            .window
            .iter()
            .map(|s| (s.best_score - avg_score).abs())
            .fold(0.0f32, f32::max);
        if spread > 0.25 {
            return CognitivePhase::Drift;
        }

        CognitivePhase::Steady
    }
}
