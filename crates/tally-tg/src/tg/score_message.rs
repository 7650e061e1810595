use crate::prelude::*;
use crate::scoring::{InboundMessage, Outcome, TagSpan};
use crate::tg;
use crate::util::DynResult;
use std::sync::Arc;
use teloxide::types::{Message, MessageEntity, MessageEntityKind, User};

pub(crate) fn filter(msg: Message) -> bool {
    msg.from().is_some() && (msg.text().is_some() || msg.caption().is_some())
}

pub(crate) async fn handle(ctx: Arc<tg::Ctx>, msg: Message) -> DynResult {
    let span = info_span!(
        "score_message",
        sender = msg.from().map(User::debug_id).as_deref(),
        chat = %msg.chat.debug_id(),
    );

    async {
        let Some(inbound) = inbound_message(&msg) else {
            return Ok(());
        };

        let outcome = ctx.scoring.process(&inbound).await?;

        match outcome {
            Outcome::NoMatch => {}
            Outcome::Awarded {
                points_added,
                new_balance,
            } => {
                let text = format!(
                    "🎉 Поймал хештег! <b>+{points_added}</b> баллов. Всего: <b>{new_balance}</b>"
                );
                tg::reply_ephemeral(&ctx, &msg, text).await?;
            }
            Outcome::AlreadyAwarded { balance } => {
                let text =
                    format!("Сегодня баллы уже начислены. Ваш баланс: <b>{balance}</b>");
                tg::reply_ephemeral(&ctx, &msg, text).await?;
            }
        }

        Ok::<_, crate::Error>(())
    }
    .instrument(span)
    .await
    .map_err(Into::into)
}

fn inbound_message(msg: &Message) -> Option<InboundMessage> {
    let user = msg.from()?;

    // Media messages carry their annotations on the caption instead.
    let (text, entities) = match (msg.text(), msg.caption()) {
        (Some(text), _) => (text, msg.entities()),
        (None, Some(caption)) => (caption, msg.caption_entities()),
        (None, None) => return None,
    };

    Some(InboundMessage {
        chat_id: msg.chat.id,
        user_id: user.id,
        full_name: user.full_name(),
        username: user.username.clone(),
        text: text.to_owned(),
        spans: entities.map(tag_spans).unwrap_or_default(),
    })
}

fn tag_spans(entities: &[MessageEntity]) -> Vec<TagSpan> {
    entities.map_collect(|entity| TagSpan {
        offset: entity.offset,
        len: entity.length,
        is_hashtag: matches!(entity.kind, MessageEntityKind::Hashtag),
    })
}
