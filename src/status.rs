//! JSON status document sent in reply to `status` requests.

use serde::Serialize;

use crate::tracker::PeriodSnapshot;

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    periods: Vec<PeriodStatus<'a>>,
}

#[derive(Debug, Serialize)]
struct PeriodStatus<'a> {
    name: &'a str,
    safe: bool,
    accumulated_seconds: u64,
    break_at: u64,
}

/// Encode a tracker snapshot as one newline-terminated JSON frame.
pub fn encode(snapshot: &[PeriodSnapshot]) -> Vec<u8> {
    let report = StatusReport {
        periods: snapshot
            .iter()
            .map(|period| PeriodStatus {
                name: &period.name,
                safe: period.safe,
                accumulated_seconds: period.active_seconds,
                break_at: period.limit_seconds,
            })
            .collect(),
    };

    // Plain strings, bools and integers always serialize.
    let mut frame = serde_json::to_vec(&report).unwrap_or_default();
    frame.push(b'\n');
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Tracker;

    #[test]
    fn encodes_periods_in_order() {
        let mut tracker = Tracker::default();
        tracker.provide_active_seconds(200);

        let frame = encode(&tracker.snapshot());
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);

        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        let periods = value["periods"].as_array().unwrap();
        assert_eq!(periods.len(), 3);
        assert_eq!(periods[0]["name"], "micro");
        assert_eq!(periods[0]["safe"], false);
        assert_eq!(periods[0]["accumulated_seconds"], 200);
        assert_eq!(periods[0]["break_at"], 180);
        assert_eq!(periods[2]["name"], "workday");
        assert_eq!(periods[2]["safe"], true);
    }

    #[test]
    fn exact_wire_shape() {
        let snapshot = vec![PeriodSnapshot {
            name: "micro".to_string(),
            safe: true,
            active_seconds: 7,
            limit_seconds: 180,
        }];
        assert_eq!(
            encode(&snapshot),
            b"{\"periods\":[{\"name\":\"micro\",\"safe\":true,\"accumulated_seconds\":7,\"break_at\":180}]}\n"
        );
    }

    #[test]
    fn empty_snapshot_is_still_valid_json() {
        assert_eq!(encode(&[]), b"{\"periods\":[]}\n");
    }

    #[test]
    fn names_are_escaped() {
        let snapshot = vec![PeriodSnapshot {
            name: "odd \"name\"\n".to_string(),
            safe: true,
            active_seconds: 0,
            limit_seconds: 1,
        }];
        let frame = encode(&snapshot);
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["periods"][0]["name"], "odd \"name\"\n");
    }
}
