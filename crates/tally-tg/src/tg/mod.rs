//! Telegram transport: dispatcher wiring, commands and the hashtag handler

mod cmd;
mod config;
mod score_message;

use crate::prelude::*;
use crate::scoring::{self, ScoreService, ScoreStore};
use crate::Result;
use dptree::di::DependencyMap;
use std::sync::Arc;
use std::time::Duration;
use teloxide::adaptors::{CacheMe, DefaultParseMode, Throttle, Trace};
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::{Message, ParseMode};
use teloxide::utils::command::BotCommands;

pub(crate) use config::*;

pub(crate) type Bot = Trace<CacheMe<DefaultParseMode<Throttle<teloxide::Bot>>>>;

pub(crate) struct Ctx {
    bot: Bot,
    scoring: ScoreService,
    store: Arc<dyn ScoreStore>,
    reply_ttl: Duration,
}

pub(crate) struct RunBotOptions {
    pub(crate) tg_cfg: Config,
    pub(crate) scoring_cfg: scoring::Config,
    pub(crate) store: Arc<dyn ScoreStore>,
}

pub(crate) async fn run_bot(opts: RunBotOptions) -> Result {
    let mut di = DependencyMap::new();

    let bot: Bot = teloxide::Bot::new(opts.tg_cfg.bot_token.clone())
        .throttle(Default::default())
        .parse_mode(ParseMode::Html)
        .cache_me()
        .trace(teloxide::adaptors::trace::Settings::all());

    let scoring = ScoreService::new(&opts.scoring_cfg, opts.store.clone());

    di.insert(Arc::new(Ctx {
        bot: bot.clone(),
        scoring,
        store: opts.store,
        reply_ttl: Duration::from_secs(opts.scoring_cfg.reply_ttl_secs),
    }));

    info!("Starting bot...");

    bot.set_my_commands(cmd::regular::Cmd::bot_commands())
        .await?;

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<cmd::regular::Cmd>()
                .endpoint(cmd::handle::<cmd::regular::Cmd>()),
        )
        .branch(
            Update::filter_message()
                .filter_command::<cmd::StartCommand>()
                .filter(cmd::filter_pm_with_bot)
                .endpoint(cmd::handle::<cmd::StartCommand>()),
        )
        .branch(
            Update::filter_message()
                .filter(score_message::filter)
                .endpoint(score_message::handle),
        );

    Dispatcher::builder(bot, handler)
        .dependencies(di)
        // We don't handle all possible messages that users send,
        // so to suppress the warning that we don't do this we have
        // a noop default handler here
        .default_handler(|_| std::future::ready(()))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped");

    Ok(())
}

/// Reply to the message and schedule the reply for deletion after the
/// configured delay, so the chat doesn't silt up with bot noise.
pub(crate) async fn reply_ephemeral(ctx: &Ctx, msg: &Message, text: String) -> Result {
    let sent = ctx.bot.reply_to(msg, text).await?;

    let bot = ctx.bot.clone();
    let ttl = ctx.reply_ttl;
    let chat_id = sent.chat.id;
    let sent_id = sent.id;

    tokio::spawn(
        async move {
            tokio::time::sleep(ttl).await;

            // Best-effort: the reply may already be gone, or the bot may
            // lack the rights to delete messages in this chat.
            if let Err(err) = bot.delete_message(chat_id, sent_id).await {
                warn!(err = tracing_err(&err), "Failed to delete bot reply");
            }
        }
        .instrument(info_span!("autodelete_reply", %chat_id, msg_id = sent_id.0)),
    );

    Ok(())
}

/// Delete the user's command message in group chats to keep them tidy.
/// Private chats keep the command visible.
pub(crate) async fn delete_command_msg(ctx: &Ctx, msg: &Message) {
    if !msg.chat.is_group() && !msg.chat.is_supergroup() {
        return;
    }

    if let Err(err) = ctx.bot.delete_message(msg.chat.id, msg.id).await {
        warn!(err = tracing_err(&err), "Failed to delete user command");
    }
}
