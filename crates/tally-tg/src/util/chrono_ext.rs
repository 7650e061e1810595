use chrono::prelude::*;
use easy_ext::ext;

#[ext(FixedOffsetExt)]
pub(crate) impl FixedOffset {
    /// Current calendar date in this offset. The offset defines what "today"
    /// means for the once-per-day award limit.
    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(self).date_naive()
    }
}
