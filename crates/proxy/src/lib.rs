//! ghostlink: a splice proxy for the legacy 1.12.2 game protocol.
//!
//! One persistent "remote bot" session is kept against the backend server.
//! At most one human client may be linked onto that session at a time, with
//! raw packet flow handed over so neither the backend nor the player observes
//! a disconnect; every other connected client watches a synthesized spectator
//! view built around a ghost player entity that mirrors the bot.
//!
//! The protocol codec itself (framing, encryption, login) is external; it
//! plugs in through [`net::Session`] pairs and the [`net::RemoteConnector`]
//! seam.

pub mod command;
pub mod config;
pub mod ghost;
pub mod lifecycle;
pub mod net;
pub mod sim;
pub mod splice;
pub mod tracker;
