//! §4.6 step 1: the inverter/meter feed is a plain `timestamp,energy`
//! CSV. Malformed rows are logged and skipped rather than aborting the
//! whole tick — a single bad line from a flaky meter shouldn't stop
//! every other device's report.

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CsvRow {
    pub unix_timestamp: u64,
    pub raw_energy: f64,
}

pub fn parse(contents: &str) -> Vec<CsvRow> {
    let mut rows = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((ts, energy)) = line.split_once(',') else {
            warn!(line_no, "malformed csv row, skipping");
            continue;
        };
        let (Ok(unix_timestamp), Ok(raw_energy)) = (ts.trim().parse::<u64>(), energy.trim().parse::<f64>()) else {
            warn!(line_no, "unparseable csv row, skipping");
            continue;
        };
        rows.push(CsvRow {
            unix_timestamp,
            raw_energy,
        });
    }
    rows
}

/// §4.6 step 1: `slot = (unix - genesisUnix) / 300`,
/// `value = max(0, raw * multiplier / divider - 1)`. Values below 3 are
/// the caller's responsibility to skip (§3's reserved sentinel margin).
pub fn slot_and_value(row: CsvRow, multiplier: f64, divider: f64) -> (gca_core::timeslot::Timeslot, u32) {
    let slot = gca_core::timeslot::unix_to_slot(row.unix_timestamp);
    let adjusted = row.raw_energy * multiplier / divider - 1.0;
    let value = adjusted.max(0.0).floor() as u32;
    (slot, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_rows() {
        let csv = "1514764800,1500\n1514765100,1600\n";
        let rows = parse(csv);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].unix_timestamp, 1_514_764_800);
        assert_eq!(rows[0].raw_energy, 1500.0);
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let csv = "not-a-row\n1514764800,1500\n";
        let rows = parse(csv);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn slot_and_value_applies_multiplier_and_subtracts_one() {
        let row = CsvRow {
            unix_timestamp: gca_core::timeslot::GENESIS_UNIX_SECS,
            raw_energy: 5.0,
        };
        let (slot, value) = slot_and_value(row, 1000.0, 1000.0);
        assert_eq!(slot.0, 0);
        assert_eq!(value, 4);
    }

    #[test]
    fn value_floors_at_zero_rather_than_going_negative() {
        let row = CsvRow {
            unix_timestamp: gca_core::timeslot::GENESIS_UNIX_SECS,
            raw_energy: 0.0,
        };
        let (_, value) = slot_and_value(row, 1000.0, 1000.0);
        assert_eq!(value, 0);
    }
}
