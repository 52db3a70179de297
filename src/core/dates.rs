/// Canonical date handling: display format, lenient parsing, study days.
use chrono::NaiveDate;

/// Display format for every date in a narrative: `15-Mar-2024`.
pub const DISPLAY_FORMAT: &str = "%d-%b-%Y";

/// Format a date as two-digit day, three-letter title-case month, and
/// four-digit year.
pub fn format_date(date: NaiveDate) -> String {
    date.format(DISPLAY_FORMAT).to_string()
}

/// Parse a stored date. Accepts `YYYY-MM-DD`, an ISO datetime whose date
/// part is `YYYY-MM-DD`, or the display format itself.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date_part = trimmed.split(['T', ' ']).next().unwrap_or(trimmed);
    if date_part.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, DISPLAY_FORMAT))
        .ok()
}

/// Study day of `date` relative to the first dose. Day 1 is the first-dose
/// date; there is no day zero, so earlier dates are negative.
pub fn study_day(date: NaiveDate, first_dose: NaiveDate) -> i64 {
    let offset = (date - first_dose).num_days();
    if offset >= 0 {
        offset + 1
    } else {
        offset
    }
}

/// Whole years elapsed from `from` to `to`; zero when `to` precedes `from`.
pub fn whole_years_between(from: NaiveDate, to: NaiveDate) -> u32 {
    to.years_since(from).unwrap_or(0)
}
