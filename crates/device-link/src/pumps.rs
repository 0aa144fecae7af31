//! Background tasks driving one WebSocket session.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
