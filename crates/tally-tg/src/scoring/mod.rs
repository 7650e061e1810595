//! Hashtag-award core: extraction, the once-per-day award decision and the
//! storage port it writes through. Transport and rendering live in [`crate::tg`].

mod decide;
mod extract;
mod store;

use serde::Deserialize;
use serde_with::serde_as;
use std::collections::HashMap;

pub(crate) use decide::*;
pub(crate) use extract::*;
pub(crate) use store::*;

#[serde_as]
#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    /// Map from hashtag to the points it is worth, e.g.
    /// `{"#балл": 1, "#челлендж1": 5}`. Keys are normalized on load.
    #[serde_as(as = "serde_with::json::JsonString")]
    pub(crate) tag_table: HashMap<String, u32>,

    /// Fixed UTC offset that defines the local calendar day for the
    /// once-per-day limit.
    #[serde(default = "default_utc_offset_hours")]
    pub(crate) utc_offset_hours: i32,

    /// How long bot replies live before they are auto-deleted.
    #[serde(default = "default_reply_ttl_secs")]
    pub(crate) reply_ttl_secs: u64,
}

fn default_utc_offset_hours() -> i32 {
    // The chats this bot lives in run on Moscow time.
    3
}

fn default_reply_ttl_secs() -> u64 {
    5
}
