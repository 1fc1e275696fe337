//! Cron parsing and next-instant computation under arbitrary fields.

use proptest::prelude::*;
use steadfast_scheduler::CronExpr;

proptest! {
    #[test]
    fn in_range_literals_always_parse(
        minute in 0u8..60,
        hour in 0u8..24,
        dom in 1u8..32,
        month in 1u8..13,
        dow in 0u8..7,
    ) {
        let expr = format!("{minute} {hour} {dom} {month} {dow}");
        prop_assert!(CronExpr::parse(&expr).is_ok(), "{expr}");
    }

    #[test]
    fn out_of_range_minutes_never_parse(minute in 60u16..1000) {
        let expr = format!("{minute} * * * *");
        prop_assert!(CronExpr::parse(&expr).is_err());
    }

    #[test]
    fn next_instants_always_match_the_expression(
        minute in 0u8..60,
        hour in 0u8..24,
        step in 1u8..30,
    ) {
        use chrono::{TimeZone, Utc};

        let expr = format!("{minute} {hour} */{step} * *");
        let cron = CronExpr::parse(&expr).unwrap();
        let from = Utc.with_ymd_and_hms(2025, 3, 10, 12, 30, 0).unwrap();

        if let Some(next) = cron.next_after(from) {
            prop_assert!(next > from);
            prop_assert!(cron.matches(next), "{expr} does not match {next}");
        }
    }

    #[test]
    fn wrong_field_counts_never_parse(count in 0usize..10) {
        prop_assume!(count != 5);
        let expr = vec!["*"; count].join(" ");
        prop_assert!(CronExpr::parse(&expr).is_err());
    }
}
