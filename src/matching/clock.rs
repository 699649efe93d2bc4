use chrono::{Datelike, Timelike};

/// Source of "now" for the day/time rule filters. Injected so matching is
/// testable for arbitrary dates.
pub trait Clock: Send + Sync {
    /// Day of week, 1 = Monday through 7 = Sunday.
    fn weekday(&self) -> u32;
    /// Minutes elapsed since local midnight.
    fn minutes_of_day(&self) -> u32;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn weekday(&self) -> u32 {
        chrono::Local::now().weekday().number_from_monday()
    }

    fn minutes_of_day(&self) -> u32 {
        let now = chrono::Local::now();
        now.hour() * 60 + now.minute()
    }
}

/// Fixed clock for tests.
pub struct FixedClock {
    pub weekday: u32,
    pub minutes: u32,
}

impl Clock for FixedClock {
    fn weekday(&self) -> u32 {
        self.weekday
    }

    fn minutes_of_day(&self) -> u32 {
        self.minutes
    }
}
