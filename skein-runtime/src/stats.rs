//! Throughput and latency counters

use std::time::Duration;

/// Timing of one prefill + decode round.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoundStats {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    /// Forward passes run after prefill.
    pub decode_steps: usize,
    pub time_to_first_token: Duration,
    pub prefill_time: Duration,
    pub decode_time: Duration,
}

impl RoundStats {
    #[must_use]
    pub fn prefill_tokens_per_s(&self) -> f64 {
        per_second(self.prompt_tokens, self.prefill_time)
    }

    #[must_use]
    pub fn decode_tokens_per_s(&self) -> f64 {
        per_second(self.decode_steps, self.decode_time)
    }
}

/// Cumulative counters for a session, plus the most recent round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeStats {
    pub prefill_total_tokens: usize,
    pub prefill_total_time: Duration,
    pub decode_total_tokens: usize,
    pub decode_total_time: Duration,
    pub last_round: Option<RoundStats>,
}

impl RuntimeStats {
    pub fn record_round(&mut self, round: RoundStats) {
        self.prefill_total_tokens += round.prompt_tokens;
        self.prefill_total_time += round.prefill_time;
        self.decode_total_tokens += round.decode_steps;
        self.decode_total_time += round.decode_time;
        self.last_round = Some(round);
    }

    #[must_use]
    pub fn prefill_tokens_per_s(&self) -> f64 {
        per_second(self.prefill_total_tokens, self.prefill_total_time)
    }

    #[must_use]
    pub fn decode_tokens_per_s(&self) -> f64 {
        per_second(self.decode_total_tokens, self.decode_total_time)
    }

    /// One-line summary, e.g. `prefill: 512.0 tok/s, decode: 31.4 tok/s`.
    #[must_use]
    pub fn text(&self) -> String {
        format!(
            "prefill: {:.1} tok/s, decode: {:.1} tok/s",
            self.prefill_tokens_per_s(),
            self.decode_tokens_per_s()
        )
    }
}

#[allow(clippy::cast_precision_loss)]
fn per_second(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_rounds() {
        let mut stats = RuntimeStats::default();
        let round = RoundStats {
            prompt_tokens: 100,
            completion_tokens: 11,
            decode_steps: 10,
            time_to_first_token: Duration::from_millis(300),
            prefill_time: Duration::from_millis(250),
            decode_time: Duration::from_millis(500),
        };
        stats.record_round(round);
        stats.record_round(round);
        assert_eq!(stats.prefill_total_tokens, 200);
        assert_eq!(stats.decode_total_tokens, 20);
        assert!((stats.prefill_tokens_per_s() - 400.0).abs() < 1e-6);
        assert!((stats.decode_tokens_per_s() - 20.0).abs() < 1e-6);
        assert_eq!(stats.text(), "prefill: 400.0 tok/s, decode: 20.0 tok/s");
        assert_eq!(stats.last_round, Some(round));
    }

    #[test]
    fn zero_time_reports_zero_throughput() {
        assert_eq!(RuntimeStats::default().text(), "prefill: 0.0 tok/s, decode: 0.0 tok/s");
    }
}
