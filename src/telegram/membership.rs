use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::UserId;

use crate::admission::MembershipChecker;
use crate::core::error::{AppError, AppResult};

/// Channel membership through `getChatMember`. The bot must be an admin of
/// every checked channel.
pub struct TelegramMembership {
    bot: Bot,
}

impl TelegramMembership {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MembershipChecker for TelegramMembership {
    async fn is_member(&self, user_id: i64, channel: &str) -> AppResult<bool> {
        let user = u64::try_from(user_id)
            .map(UserId)
            .map_err(|_| AppError::Validation(format!("invalid Telegram user id {}", user_id)))?;

        let member = self
            .bot
            .get_chat_member(super::recipient(channel), user)
            .await
            .map_err(|e| AppError::Validation(format!("getChatMember failed for {}: {}", channel, e)))?;
        Ok(member.is_present())
    }
}
