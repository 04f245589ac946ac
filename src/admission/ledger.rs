//! Per-project usage log and quota limits.
//!
//! The ledger is append-only from the outside: usage is recorded as events and
//! every quota question is answered by re-aggregating those events at the time
//! it is asked. Admissions that have been granted but whose execution has not
//! finished yet are held as reservations and count toward every window, so a
//! second admission cannot spend tokens the first one is about to use.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DAILY_TOKEN_CAP: u64 = 1_000_000;
pub const DEFAULT_PER_REQUEST_TOKEN_CAP: u64 = 100_000;
pub const DEFAULT_REQUESTS_PER_MINUTE: usize = 20;
pub const DEFAULT_REQUESTS_PER_HOUR: usize = 500;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 100;
pub const DEFAULT_MAX_PARALLEL_WORKERS: usize = 3;
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

/// Quota configuration for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub daily_token_cap: u64,
    pub per_request_token_cap: u64,
    pub requests_per_minute: usize,
    pub requests_per_hour: usize,
    pub max_queue_depth: usize,
    pub max_parallel_workers: usize,
    /// Fraction of the daily cap at which the budget reports Warning.
    pub warning_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_token_cap: DEFAULT_DAILY_TOKEN_CAP,
            per_request_token_cap: DEFAULT_PER_REQUEST_TOKEN_CAP,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            requests_per_hour: DEFAULT_REQUESTS_PER_HOUR,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_parallel_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }
}

/// One recorded request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub at: DateTime<Utc>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageEvent {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Handle for tokens set aside by a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(u64);

#[derive(Debug, Clone)]
struct Reservation {
    id: ReservationId,
    at: DateTime<Utc>,
    tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub limits: BudgetLimits,
    /// Usage events in recording order.
    events: Vec<UsageEvent>,
    /// Outstanding admissions. Not persisted: executions in flight at a crash
    /// are lost with the process.
    #[serde(skip)]
    reservations: Vec<Reservation>,
    #[serde(skip)]
    next_reservation: u64,
}

impl BudgetLedger {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            events: Vec::new(),
            reservations: Vec::new(),
            next_reservation: 0,
        }
    }

    pub fn events(&self) -> &[UsageEvent] {
        &self.events
    }

    pub fn outstanding_reservations(&self) -> usize {
        self.reservations.len()
    }

    pub fn record(&mut self, event: UsageEvent) {
        self.events.push(event);
    }

    pub fn reserve(&mut self, tokens: u64, now: DateTime<Utc>) -> ReservationId {
        let id = ReservationId(self.next_reservation);
        self.next_reservation += 1;
        self.reservations.push(Reservation { id, at: now, tokens });
        id
    }

    /// Replace a reservation with the usage it actually incurred. The event
    /// keeps the reservation's timestamp so the request is counted once, in
    /// the window it was admitted in. Unknown reservations are recorded at
    /// `now`.
    pub fn settle(
        &mut self,
        id: ReservationId,
        input_tokens: u64,
        output_tokens: u64,
        now: DateTime<Utc>,
    ) -> UsageEvent {
        let at = match self.reservations.iter().position(|r| r.id == id) {
            Some(pos) => self.reservations.remove(pos).at,
            None => now,
        };
        let event = UsageEvent {
            at,
            input_tokens,
            output_tokens,
        };
        self.events.push(event.clone());
        event
    }

    /// Drop a reservation without recording usage.
    pub fn release(&mut self, id: ReservationId) -> bool {
        let before = self.reservations.len();
        self.reservations.retain(|r| r.id != id);
        self.reservations.len() != before
    }

    /// Tokens used in the current UTC day plus every outstanding reservation.
    pub fn tokens_today(&self, now: DateTime<Utc>) -> u64 {
        let start = day_start(now);
        let recorded: u64 = self
            .events
            .iter()
            .filter(|e| e.at >= start)
            .map(UsageEvent::total)
            .sum();
        let reserved: u64 = self.reservations.iter().map(|r| r.tokens).sum();
        recorded.saturating_add(reserved)
    }

    /// Requests (recorded or reserved) in the trailing `window`.
    pub fn requests_within(&self, window: Duration, now: DateTime<Utc>) -> usize {
        let since = now - window;
        self.event_times().filter(|at| *at > since).count()
    }

    /// When the oldest request in the trailing `window` leaves it.
    pub fn window_reset(&self, window: Duration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let since = now - window;
        self.event_times()
            .filter(|at| *at > since)
            .min()
            .map(|oldest| oldest + window)
    }

    /// Discard events that no window can see any more.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let horizon = day_start(now).min(now - Duration::hours(1));
        let before = self.events.len();
        self.events.retain(|e| e.at >= horizon);
        before - self.events.len()
    }

    fn event_times(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.events
            .iter()
            .map(|e| e.at)
            .chain(self.reservations.iter().map(|r| r.at))
    }
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new(BudgetLimits::default())
    }
}

/// Start of the UTC calendar day containing `now`.
pub fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Next UTC midnight, when the daily window resets.
pub fn next_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    day_start(now) + Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap()
    }

    fn event(at: DateTime<Utc>, tokens: u64) -> UsageEvent {
        UsageEvent {
            at,
            input_tokens: tokens,
            output_tokens: 0,
        }
    }

    #[test]
    fn test_day_boundaries() {
        let now = noon();
        assert_eq!(day_start(now), Utc.with_ymd_and_hms(2025, 3, 14, 0, 0, 0).unwrap());
        assert_eq!(next_day_start(now), Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_tokens_today_ignores_yesterday() {
        let now = noon();
        let mut ledger = BudgetLedger::default();
        ledger.record(event(now - Duration::days(1), 500));
        ledger.record(event(now - Duration::hours(2), 300));
        ledger.record(UsageEvent {
            at: now,
            input_tokens: 10,
            output_tokens: 20,
        });
        assert_eq!(ledger.tokens_today(now), 330);
    }

    #[test]
    fn test_reservations_count_until_settled() {
        let now = noon();
        let mut ledger = BudgetLedger::default();
        let id = ledger.reserve(400, now);
        assert_eq!(ledger.tokens_today(now), 400);
        assert_eq!(ledger.requests_within(Duration::minutes(1), now), 1);

        let event = ledger.settle(id, 100, 50, now + Duration::seconds(30));
        assert_eq!(event.at, now, "settled usage keeps the admission time");
        assert_eq!(ledger.tokens_today(now), 150);
        assert_eq!(ledger.requests_within(Duration::minutes(1), now), 1);
        assert_eq!(ledger.outstanding_reservations(), 0);
    }

    #[test]
    fn test_release_discards_reservation() {
        let now = noon();
        let mut ledger = BudgetLedger::default();
        let id = ledger.reserve(400, now);
        assert!(ledger.release(id));
        assert!(!ledger.release(id));
        assert_eq!(ledger.tokens_today(now), 0);
    }

    #[test]
    fn test_trailing_window_counts_and_reset() {
        let now = noon();
        let mut ledger = BudgetLedger::default();
        ledger.record(event(now - Duration::seconds(90), 1));
        ledger.record(event(now - Duration::seconds(40), 1));
        ledger.record(event(now - Duration::seconds(10), 1));

        assert_eq!(ledger.requests_within(Duration::minutes(1), now), 2);
        assert_eq!(ledger.requests_within(Duration::hours(1), now), 3);
        assert_eq!(
            ledger.window_reset(Duration::minutes(1), now),
            Some(now + Duration::seconds(20))
        );
    }

    #[test]
    fn test_prune_keeps_everything_still_visible() {
        let now = noon();
        let mut ledger = BudgetLedger::default();
        ledger.record(event(now - Duration::days(2), 1));
        ledger.record(event(now - Duration::hours(3), 1));
        ledger.record(event(now, 1));

        assert_eq!(ledger.prune(now), 1);
        assert_eq!(ledger.events().len(), 2);
    }

    #[test]
    fn test_prune_just_after_midnight_keeps_last_hour() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 0, 10, 0).unwrap();
        let mut ledger = BudgetLedger::default();
        ledger.record(event(now - Duration::minutes(30), 1));
        assert_eq!(ledger.prune(now), 0);
        assert_eq!(ledger.requests_within(Duration::hours(1), now), 1);
        assert_eq!(ledger.tokens_today(now), 0);
    }

    #[test]
    fn test_ledger_serialization_skips_reservations() {
        let now = noon();
        let mut ledger = BudgetLedger::default();
        ledger.record(event(now, 5));
        ledger.reserve(100, now);

        let json = serde_json::to_string(&ledger).unwrap();
        let parsed: BudgetLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.events().len(), 1);
        assert_eq!(parsed.outstanding_reservations(), 0);
        assert_eq!(parsed.limits, BudgetLimits::default());
    }
}
