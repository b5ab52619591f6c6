//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business logic and persistence concerns so route
//! handlers can stay focused on protocol translation and fan-out plumbing:
//! `room` is the membership registry, `drawing` the append-only log store,
//! `cursor` the ephemeral pointer state, `persistence` the background flush.

pub mod cursor;
pub mod drawing;
pub mod persistence;
pub mod room;
