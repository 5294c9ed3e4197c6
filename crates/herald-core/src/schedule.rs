//! Delivery-time math anchored to the recipient's own clock.
//!
//! All functions take `now` explicitly; nothing here reads the system clock.

use chrono::{
    DateTime, Days, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc,
};
use chrono_tz::Tz;

/// Local time used when a stored preference cannot be parsed.
pub const FALLBACK_DELIVERY_TIME: (u32, u32) = (8, 0);

/// Longest DST gap we step across when resolving a local time.
const MAX_GAP_MINUTES: i64 = 180;

/// A recipient's preferred local delivery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPreference {
    pub delivery_time: NaiveTime,
    pub timezone: Tz,
}

impl Default for DeliveryPreference {
    fn default() -> Self {
        Self {
            delivery_time: fallback_time(),
            timezone: Tz::UTC,
        }
    }
}

impl DeliveryPreference {
    #[must_use]
    pub fn new(delivery_time: NaiveTime, timezone: Tz) -> Self {
        Self {
            delivery_time,
            timezone,
        }
    }

    /// Parses stored preference strings. A malformed `HH:MM` falls back to
    /// 08:00 and an unknown IANA zone falls back to UTC; neither is an error.
    #[must_use]
    pub fn parse(delivery_time: &str, timezone: &str) -> Self {
        let time = parse_time(delivery_time).unwrap_or_else(fallback_time);
        let tz = timezone.trim().parse::<Tz>().unwrap_or(Tz::UTC);
        Self::new(time, tz)
    }

    /// The recipient-local calendar date at `now`.
    #[must_use]
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    /// The delivery slot on a given local date, as a UTC instant.
    #[must_use]
    pub fn slot_on(&self, date: NaiveDate) -> DateTime<Utc> {
        resolve_local(self.timezone, date.and_time(self.delivery_time))
    }

    /// Next occurrence of the preferred local time strictly after `now`.
    #[must_use]
    pub fn next_delivery_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = self.local_date(now);
        let slot = self.slot_on(today);
        if slot > now {
            return slot;
        }
        match today.checked_add_days(Days::new(1)) {
            Some(tomorrow) => self.slot_on(tomorrow),
            None => slot,
        }
    }

    /// If `now` falls inside the generation window of an upcoming slot,
    /// returns that slot's local date.
    ///
    /// The window for a slot at `T` is `[T - lead, T - lead + window)`. Both
    /// today's and tomorrow's slots are checked so windows that straddle
    /// local midnight still resolve to the slot they prepare.
    #[must_use]
    pub fn due_period(
        &self,
        now: DateTime<Utc>,
        lead: TimeDelta,
        window: TimeDelta,
    ) -> Option<NaiveDate> {
        let today = self.local_date(now);
        let candidates = [
            today.checked_sub_days(Days::new(1)),
            Some(today),
            today.checked_add_days(Days::new(1)),
        ];
        candidates.into_iter().flatten().find(|date| {
            let start = self.slot_on(*date) - lead;
            start <= now && now < start + window
        })
    }
}

fn fallback_time() -> NaiveTime {
    let (h, m) = FALLBACK_DELIVERY_TIME;
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

/// Maps a local wall-clock time to UTC. Ambiguous times take the earlier
/// instant; times inside a DST gap take the first valid instant after it.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        LocalResult::None => (1..=MAX_GAP_MINUTES)
            .find_map(|m| {
                tz.from_local_datetime(&(local + TimeDelta::minutes(m)))
                    .earliest()
            })
            .map_or_else(|| Utc.from_utc_datetime(&local), |dt| dt.with_timezone(&Utc)),
    }
}
