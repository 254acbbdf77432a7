//! Teloxide-backed collaborators (feature `telegram`)

pub mod membership;
pub mod transport;

pub use membership::TelegramMembership;
pub use transport::TelegramTransport;

use teloxide::types::{ChatId, Recipient};

/// `@username` or a numeric chat id.
pub(crate) fn recipient(channel: &str) -> Recipient {
    match channel.trim().parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(channel.trim().to_string()),
    }
}
