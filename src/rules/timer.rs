//! Scheduled rule conditions.
//!
//! A [`TimerJob`] owns every task spawned for one rule: one weekly loop per
//! day of a `DAILY_TIMER` condition and one counted loop per `SIMPLE_TIMER`
//! condition. Cancelling the job stops all of them; dropping it cancels too.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{Condition, DailyTimerCondition, RuleDefinition, SimpleTimerCondition};
use super::time_range::{parse_clock, parse_days};
use crate::error::RuleError;
use crate::protocol::handlers::RuleActionHandler;

pub const SIMPLE_TIMER_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A first tick later than this after the configured start suppresses the job
pub const START_GRACE: Duration = Duration::from_secs(1);

/// Next instant strictly after `now` that falls on `weekday` at `time` (UTC).
pub fn next_weekly_occurrence(now: DateTime<Utc>, weekday: Weekday, time: NaiveTime) -> DateTime<Utc> {
    let ahead = (7 + weekday.num_days_from_monday() - now.weekday().num_days_from_monday()) % 7;
    let date = now.date_naive() + Days::new(u64::from(ahead));
    let candidate = Utc.from_utc_datetime(&date.and_time(time));
    if candidate > now {
        candidate
    } else {
        candidate + chrono::Duration::days(7)
    }
}

pub fn parse_start_time(value: &str) -> Result<DateTime<Utc>, RuleError> {
    NaiveDateTime::parse_from_str(value.trim(), SIMPLE_TIMER_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| RuleError::InvalidStartTime(value.to_string()))
}

fn until(target: DateTime<Utc>) -> Duration {
    (target - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

pub struct TimerJob {
    rule_id: String,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TimerJob {
    /// Spawns the tasks for every timer condition of `rule`.
    ///
    /// Malformed conditions are logged and skipped; the remaining ones are
    /// still scheduled. Must be called from within a tokio runtime.
    pub fn schedule(rule: &RuleDefinition, handler: Arc<dyn RuleActionHandler>) -> Self {
        let rule = Arc::new(rule.clone());
        let mut job = Self {
            rule_id: rule.rule_id.clone(),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        };

        for condition in &rule.conditions {
            let scheduled = match condition {
                Condition::DailyTimer(daily) => job.schedule_daily(daily, &rule, &handler),
                Condition::SimpleTimer(simple) => job.schedule_simple(simple, &rule, &handler),
                Condition::DeviceData(_) | Condition::Unknown => Ok(()),
            };
            if let Err(e) = scheduled {
                warn!("Skipping timer condition of rule {}: {e}", rule.rule_id);
            }
        }
        info!("Scheduled {} timer task(s) for rule {}", job.tasks.len(), job.rule_id);
        job
    }

    fn schedule_daily(
        &mut self,
        condition: &DailyTimerCondition,
        rule: &Arc<RuleDefinition>,
        handler: &Arc<dyn RuleActionHandler>,
    ) -> Result<(), RuleError> {
        let time = parse_clock(&condition.time)?;
        let days = parse_days(&condition.days_of_week)?;
        if days.is_empty() {
            return Err(RuleError::InvalidDay(condition.days_of_week.clone()));
        }

        for weekday in days {
            let cancel = self.cancel.clone();
            let rule = Arc::clone(rule);
            let handler = Arc::clone(handler);
            self.tasks.push(tokio::spawn(async move {
                // waking slightly early must not schedule the same occurrence twice
                let mut last = Utc::now();
                loop {
                    let next = next_weekly_occurrence(last.max(Utc::now()), weekday, time);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(until(next)) => {}
                    }
                    last = next;
                    fire(&rule, &handler, &cancel);
                }
            }));
        }
        Ok(())
    }

    fn schedule_simple(
        &mut self,
        condition: &SimpleTimerCondition,
        rule: &Arc<RuleDefinition>,
        handler: &Arc<dyn RuleActionHandler>,
    ) -> Result<(), RuleError> {
        if condition.repeat_interval <= 0 {
            return Err(RuleError::InvalidInterval(condition.repeat_interval));
        }
        let start = parse_start_time(&condition.start_time)?;
        let period = Duration::from_secs(condition.repeat_interval.unsigned_abs());
        let limit = u64::try_from(condition.repeat_count).ok().filter(|n| *n > 0);

        let cancel = self.cancel.clone();
        let rule = Arc::clone(rule);
        let handler = Arc::clone(handler);
        self.tasks.push(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + until(start), period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut runs = 0u64;
            while limit.map_or(true, |limit| runs < limit) {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticks.tick() => {}
                }
                if runs == 0 {
                    let late = (Utc::now() - start).to_std().unwrap_or(Duration::ZERO);
                    if late > START_GRACE {
                        warn!(
                            "Simple timer of rule {} missed its start {start} by {late:?}; not running",
                            rule.rule_id
                        );
                        return;
                    }
                }
                runs += 1;
                fire(&rule, &handler, &cancel);
            }
            debug!("Simple timer of rule {} finished after {runs} run(s)", rule.rule_id);
        }));
        Ok(())
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops every task of this job. No firing starts after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for TimerJob {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn fire(rule: &RuleDefinition, handler: &Arc<dyn RuleActionHandler>, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }
    if !rule.time_range.applies_at(Utc::now()) {
        debug!("Timer for rule {} outside its time range", rule.rule_id);
        return;
    }
    info!("Timer fired for rule {}", rule.rule_id);
    handler.on_rule_actions(&rule.actions);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{RuleAction, RuleLogic, TimeRange};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl RuleActionHandler for Counter {
        fn on_rule_actions(&self, _actions: &[RuleAction]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rule(conditions: Vec<Condition>) -> RuleDefinition {
        RuleDefinition {
            rule_id: "timer".into(),
            rule_name: String::new(),
            logic: RuleLogic::Or,
            time_range: TimeRange::default(),
            status: "active".into(),
            conditions,
            actions: vec![RuleAction::default()],
            version: 1,
        }
    }

    fn simple(start: DateTime<Utc>, interval: i64, count: i64) -> Condition {
        Condition::SimpleTimer(SimpleTimerCondition {
            start_time: start.format(SIMPLE_TIMER_FORMAT).to_string(),
            repeat_interval: interval,
            repeat_count: count,
        })
    }

    #[test]
    fn test_next_weekly_occurrence() {
        // Monday 2024-01-01 10:00
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let eleven = NaiveTime::from_hms_opt(11, 0, 0).unwrap();

        assert_eq!(
            next_weekly_occurrence(now, Weekday::Mon, eleven),
            Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()
        );
        assert_eq!(
            next_weekly_occurrence(now, Weekday::Mon, nine),
            Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap()
        );
        assert_eq!(
            next_weekly_occurrence(now, Weekday::Sun, nine),
            Utc.with_ymd_and_hms(2024, 1, 7, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_start_time() {
        assert_eq!(
            parse_start_time("2024-03-01 12:30:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
        );
        assert!(matches!(
            parse_start_time("2024-03-01T12:30:00Z"),
            Err(RuleError::InvalidStartTime(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_timer_runs_limited_times() {
        let counter = Arc::new(Counter::default());
        let start = Utc::now() + chrono::Duration::hours(1);
        let job = TimerJob::schedule(&rule(vec![simple(start, 60, 3)]), counter.clone());
        assert_eq!(job.task_count(), 1);

        tokio::time::sleep(Duration::from_secs(3600 + 600)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_timer_past_start_is_suppressed() {
        let counter = Arc::new(Counter::default());
        let start = Utc::now() - chrono::Duration::minutes(5);
        let _job = TimerJob::schedule(&rule(vec![simple(start, 10, 0)]), counter.clone());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_firing() {
        let counter = Arc::new(Counter::default());
        let start = Utc::now() + chrono::Duration::minutes(1);
        let job = TimerJob::schedule(&rule(vec![simple(start, 10, 0)]), counter.clone());

        job.cancel();
        assert!(job.is_cancelled());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_conditions_are_skipped() {
        let counter = Arc::new(Counter::default());
        let conditions = vec![
            Condition::DailyTimer(DailyTimerCondition {
                time: "25:00".into(),
                days_of_week: "1".into(),
            }),
            Condition::SimpleTimer(SimpleTimerCondition {
                start_time: "2024-01-01 00:00:00".into(),
                repeat_interval: 0,
                repeat_count: 1,
            }),
            Condition::DailyTimer(DailyTimerCondition {
                time: "07:30".into(),
                days_of_week: "2,3".into(),
            }),
        ];
        let job = TimerJob::schedule(&rule(conditions), counter);
        assert_eq!(job.task_count(), 2);
    }
}
