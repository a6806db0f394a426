//! Calendar helpers for the monthly quota window.

use time::{Date, Month, OffsetDateTime, Time, UtcOffset};

/// Returns the first instant (UTC midnight) of the calendar month after `now`.
///
/// Used to advance `pushes_reset_at` when a quota window rolls over.
pub fn next_month_start(now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(UtcOffset::UTC);
    let (year, month) = match now.month() {
        Month::December => (now.year() + 1, Month::January),
        m => (now.year(), m.next()),
    };
    // Day 1 of any month is always a valid date.
    let date = Date::from_calendar_date(year, month, 1)
        .unwrap_or_else(|_| now.date());
    OffsetDateTime::new_utc(date, Time::MIDNIGHT)
}
