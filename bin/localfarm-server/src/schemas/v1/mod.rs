pub mod advice;
pub mod chat;
