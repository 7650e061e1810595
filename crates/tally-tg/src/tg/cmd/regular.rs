use crate::prelude::*;
use crate::tg;
use crate::Result;
use async_trait::async_trait;
use teloxide::types::Message;
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;

const TOP_LIMIT: u32 = 10;

#[derive(BotCommands, Clone, Debug)]
#[command(
    rename_rule = "snake_case",
    description = "The following commands are available:"
)]
pub(crate) enum Cmd {
    #[command(description = "display this text")]
    Help,

    #[command(description = "show your points in this chat")]
    Balance,

    #[command(description = "show the top-10 of this chat")]
    Top,
}

#[async_trait]
impl tg::cmd::Command for Cmd {
    async fn handle(self, ctx: &tg::Ctx, msg: &Message) -> Result {
        match self {
            Cmd::Help => {
                // Help goes through the same reply lifecycle as the other
                // commands: the reply is auto-deleted after the TTL and the
                // command message is cleaned up in group chats.
                let help = html::escape(&Cmd::descriptions().to_string());
                tg::reply_ephemeral(ctx, msg, help).await?;
                tg::delete_command_msg(ctx, msg).await;
            }
            Cmd::Balance => {
                let Some(user) = msg.from() else {
                    return Ok(());
                };

                let balance = ctx.store.balance(msg.chat.id, user.id).await?.unwrap_or(0);

                tg::reply_ephemeral(ctx, msg, format!("Ваш баланс: <b>{balance}</b>")).await?;
                tg::delete_command_msg(ctx, msg).await;
            }
            Cmd::Top => {
                let top = ctx.store.top(msg.chat.id, TOP_LIMIT).await?;

                let text = if top.is_empty() {
                    "Пока никто не заработал баллов".to_owned()
                } else {
                    let lines: Vec<String> = top.iter().enumerate().map_collect(|(place, record)| {
                        format!(
                            "{}. {} — <b>{}</b>",
                            place + 1,
                            html::escape(record.display_name()),
                            record.points,
                        )
                    });

                    format!("<b>Топ участников:</b>\n{}", lines.join("\n"))
                };

                tg::reply_ephemeral(ctx, msg, text).await?;
                tg::delete_command_msg(ctx, msg).await;
            }
        }
        Ok(())
    }
}
