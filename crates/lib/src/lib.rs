//! Medra core library: session state, REST client, streaming replies, chat history,
//! and a reference backend, used by the `medra` CLI.

pub mod api;
pub mod backend;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod session;
pub mod stream;
