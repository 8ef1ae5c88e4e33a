//! Built-in self-test (`--test`)
//!
//! Pushes two fixed sample lines through parse, encode and decode and
//! requires every field to survive unchanged.

use crate::error::Result;
use crate::parser::parse_apps_installed;
use memc_common::codec::verify_round_trip;
use tracing::debug;

pub const SAMPLE_LINES: [&str; 2] = [
    "idfa\t1rfw452y52g2gq4g\t55.55\t42.42\t1423,43,567,3,7,23",
    "gaid\t7rfw452y52g2gq4g\t55.55\t42.42\t7423,424",
];

pub fn run() -> Result<()> {
    for line in SAMPLE_LINES {
        let record = parse_apps_installed(line)?;
        let unpacked = verify_round_trip(&record.to_user_apps())?;
        debug!("{} -> {}", record.key(), unpacked);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_self_test_passes() {
        run().unwrap();
    }

    #[test]
    fn test_sample_lines_parse() {
        let first = parse_apps_installed(SAMPLE_LINES[0]).unwrap();
        assert_eq!(first.key(), "idfa:1rfw452y52g2gq4g");
        assert_eq!(first.apps, vec![1423, 43, 567, 3, 7, 23]);

        let second = parse_apps_installed(SAMPLE_LINES[1]).unwrap();
        assert_eq!(second.key(), "gaid:7rfw452y52g2gq4g");
        assert_eq!(second.apps, vec![7423, 424]);
        assert_eq!((second.lat, second.lon), (55.55, 42.42));
    }
}
