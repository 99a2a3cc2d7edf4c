pub mod messages;
pub mod ws;
