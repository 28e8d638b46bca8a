//! Calendar age derived from a birth date.

use time::Date;
use time::macros::format_description;

/// Whole years between `birth` and `today`, by calendar components only.
///
/// The year difference is reduced by one when today's (month, day) comes
/// before the birthday's (month, day). A birth date after `today` yields a
/// negative value; callers reject those before storing.
#[must_use]
pub fn age_on(birth: Date, today: Date) -> i32 {
    let mut age = today.year() - birth.year();
    let birthday = (u8::from(birth.month()), birth.day());
    let current = (u8::from(today.month()), today.day());
    if current < birthday {
        age -= 1;
    }
    age
}

/// Parse an ISO calendar date (`YYYY-MM-DD`).
///
/// # Errors
///
/// Returns the parser error if `raw` is not a valid calendar date.
pub fn parse_birth_date(raw: &str) -> Result<Date, time::error::Parse> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
}

#[cfg(test)]
#[path = "age_test.rs"]
mod tests;
