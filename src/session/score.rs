use crate::types::*;
use chrono::{DateTime, Utc};

/// Points for a correct guess
pub const BASE_POINTS: u32 = 100;
/// Maximum speed bonus, decaying to zero over `SPEED_WINDOW_SECS`
pub const MAX_SPEED_BONUS: f64 = 50.0;
pub const SPEED_WINDOW_SECS: f64 = 30.0;

/// Score a guess.
///
/// Wrong guesses always score 0. A correct guess earns the base points, a
/// linearly decaying speed bonus, and a brevity bonus for short conversations.
pub fn compute(
    actual: OpponentKind,
    guess: Guess,
    start_time: DateTime<Utc>,
    decision_time: DateTime<Utc>,
    message_count: usize,
) -> GuessOutcome {
    if guess != actual {
        return GuessOutcome {
            is_correct: false,
            score: 0,
        };
    }

    let elapsed_secs = (decision_time - start_time).num_milliseconds() as f64 / 1000.0;
    let speed_bonus = (MAX_SPEED_BONUS - elapsed_secs / SPEED_WINDOW_SECS * MAX_SPEED_BONUS)
        .clamp(0.0, MAX_SPEED_BONUS)
        .round() as u32;

    GuessOutcome {
        is_correct: true,
        score: BASE_POINTS + speed_bonus + brevity_bonus(message_count),
    }
}

fn brevity_bonus(message_count: usize) -> u32 {
    match message_count {
        0..=4 => 25,
        5..=8 => 10,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_correct_fast_short_conversation() {
        let t0 = Utc::now();
        let outcome = compute(OpponentKind::Ai, OpponentKind::Ai, t0, t0 + Duration::seconds(10), 3);
        assert_eq!(
            outcome,
            GuessOutcome {
                is_correct: true,
                score: 158
            }
        );
    }

    #[test]
    fn test_wrong_guess_scores_zero() {
        let t0 = Utc::now();
        let outcome = compute(OpponentKind::Ai, OpponentKind::Human, t0, t0 + Duration::seconds(10), 3);
        assert_eq!(
            outcome,
            GuessOutcome {
                is_correct: false,
                score: 0
            }
        );
    }

    #[test]
    fn test_slow_guess_gets_no_speed_bonus() {
        let t0 = Utc::now();
        let outcome = compute(OpponentKind::Ai, OpponentKind::Ai, t0, t0 + Duration::seconds(40), 6);
        assert_eq!(outcome.score, 110);
    }

    #[test]
    fn test_bonus_edges() {
        let t0 = Utc::now();
        // Instant guess gets the full speed bonus, long conversation no brevity bonus
        let outcome = compute(OpponentKind::Human, OpponentKind::Human, t0, t0, 9);
        assert_eq!(outcome.score, 150);
        // Decision before start clamps to the maximum
        let outcome = compute(OpponentKind::Human, OpponentKind::Human, t0, t0 - Duration::seconds(5), 8);
        assert_eq!(outcome.score, 160);
        assert_eq!(brevity_bonus(4), 25);
        assert_eq!(brevity_bonus(5), 10);
        assert_eq!(brevity_bonus(9), 0);
    }
}
