//! Boolean expressions over event references with optional time windows.

use std::ops::{BitAnd, BitOr, Not};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{EventLookup, EventReference};

/// A composable predicate over event history.
///
/// Build expressions with the `&`, `|` and `!` operators:
///
/// ```ignore
/// let expr = EventExpression::within("sensor.on", Duration::from_secs(3))
///     & !EventExpression::happened("sensor.off");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EventExpression {
    /// True iff a matching event exists, within `window` of the evaluation
    /// time when a window is set.
    Happened {
        reference: EventReference,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window: Option<Duration>,
    },
    And {
        left: Box<EventExpression>,
        right: Box<EventExpression>,
    },
    Or {
        left: Box<EventExpression>,
        right: Box<EventExpression>,
    },
    Not {
        inner: Box<EventExpression>,
    },
}

impl EventExpression {
    /// Leaf that is true once a matching event has ever happened.
    pub fn happened(reference: impl Into<EventReference>) -> Self {
        EventExpression::Happened {
            reference: reference.into(),
            window: None,
        }
    }

    /// Leaf that is true iff a matching event happened in `[at - window, at]`.
    pub fn within(reference: impl Into<EventReference>, window: Duration) -> Self {
        EventExpression::Happened {
            reference: reference.into(),
            window: Some(window),
        }
    }

    /// Evaluate against `lookup` as of `at`. Events after `at` are ignored.
    pub fn evaluate(&self, lookup: &dyn EventLookup, at: DateTime<Utc>) -> bool {
        match self {
            EventExpression::Happened { reference, window } => {
                let Some(event) = lookup.latest(reference, at) else {
                    return false;
                };
                match window {
                    None => true,
                    // Windows reaching before the representable range cover
                    // all of history.
                    Some(window) => chrono::Duration::from_std(*window)
                        .ok()
                        .and_then(|window| at.checked_sub_signed(window))
                        .is_none_or(|lower| event.timestamp >= lower),
                }
            }
            EventExpression::And { left, right } => {
                left.evaluate(lookup, at) && right.evaluate(lookup, at)
            }
            EventExpression::Or { left, right } => {
                left.evaluate(lookup, at) || right.evaluate(lookup, at)
            }
            EventExpression::Not { inner } => !inner.evaluate(lookup, at),
        }
    }

    /// Every leaf reference in the expression, deduplicated, in first-seen order.
    pub fn references(&self) -> Vec<EventReference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<EventReference>) {
        match self {
            EventExpression::Happened { reference, .. } => {
                if !out.contains(reference) {
                    out.push(reference.clone());
                }
            }
            EventExpression::And { left, right } | EventExpression::Or { left, right } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            EventExpression::Not { inner } => inner.collect_references(out),
        }
    }
}

impl From<EventReference> for EventExpression {
    fn from(reference: EventReference) -> Self {
        EventExpression::happened(reference)
    }
}

impl BitAnd for EventExpression {
    type Output = EventExpression;

    fn bitand(self, rhs: Self) -> Self::Output {
        EventExpression::And {
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }
}

impl BitOr for EventExpression {
    type Output = EventExpression;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventExpression::Or {
            left: Box::new(self),
            right: Box::new(rhs),
        }
    }
}

impl Not for EventExpression {
    type Output = EventExpression;

    fn not(self) -> Self::Output {
        EventExpression::Not {
            inner: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::events::{Event, EventLog};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn missing_event_is_false_not_error() {
        let log = EventLog::new();
        assert!(!EventExpression::happened("nothing").evaluate(&log, t(0)));
        assert!((!EventExpression::happened("nothing")).evaluate(&log, t(0)));
    }

    #[test]
    fn window_lower_bound_is_inclusive() {
        let mut log = EventLog::new();
        log.append(Event::at("ping", t(0)));
        let expr = EventExpression::within("ping", Duration::from_secs(5));

        assert!(expr.evaluate(&log, t(5)));
        assert!(!expr.evaluate(&log, t(6)));
        // Not yet happened as of an earlier instant.
        assert!(!expr.evaluate(&log, t(-1)));
    }

    #[test]
    fn sensor_on_off_scenario() {
        let mut log = EventLog::new();
        log.append(Event::at("sensor.on", t(0)));

        let recently_on = EventExpression::within("sensor.on", Duration::from_secs(3));
        let never_off = !EventExpression::happened("sensor.off");
        let expr = recently_on.clone() & never_off.clone();

        assert!(expr.evaluate(&log, t(2)));
        assert!(!expr.evaluate(&log, t(10)));

        log.append(Event::at("sensor.off", t(1)));
        assert!(!never_off.evaluate(&log, t(10)));
        assert!(!expr.evaluate(&log, t(2)));
        assert!(recently_on.evaluate(&log, t(2)));
    }

    #[test]
    fn huge_windows_cover_all_history() {
        let mut log = EventLog::new();
        log.append(Event::at("ping", t(0)));

        let expr = EventExpression::within("ping", Duration::from_secs(10_000_000_000_000));
        assert!(expr.evaluate(&log, t(5)));
        assert!(EventExpression::within("ping", Duration::MAX).evaluate(&log, t(5)));
    }

    #[test]
    fn or_and_references() {
        let mut log = EventLog::new();
        log.append(Event::at("b", t(0)));

        let expr = EventExpression::happened("a") | EventExpression::happened("b");
        assert!(expr.evaluate(&log, t(1)));

        let nested = (EventExpression::happened("a") & EventExpression::happened("b"))
            | !EventExpression::happened("a");
        let names: Vec<String> = nested.references().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn expression_serializes_with_op_tag() {
        let expr = EventExpression::happened("a") & !EventExpression::within("b", Duration::from_secs(2));
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(json["op"], "and");
        assert_eq!(json["right"]["op"], "not");
        let back: EventExpression = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }
}
