pub mod chat;
pub mod fallback;
pub mod status;
