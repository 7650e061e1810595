use serde::Deserialize;

#[derive(Deserialize, Clone)]
pub(crate) struct Config {
    pub(crate) bot_token: String,
}
