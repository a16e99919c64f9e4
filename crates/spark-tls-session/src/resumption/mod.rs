//! 会话恢复：客户端会话缓存与服务端票据上下文。
//!
//! 两类材料按角色隔离：客户端缓存只被客户端连接读取，票据密钥只被服务端连接使用。

mod client;
mod lru;
mod ticket;

use std::time::{SystemTime, UNIX_EPOCH};

pub use client::{ClientSession, ClientSessionCache};
pub(crate) use ticket::TicketIssuer;
pub use ticket::{TicketBlob, TicketContext};

/// 返回 UNIX 秒数的时钟，便于在测试中注入可控时间。
pub type UnixClock = fn() -> u64;

/// 基于系统时间的默认时钟；系统时间早于纪元时返回 0。
pub fn system_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
