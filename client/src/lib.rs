//! Watch party client: keeps a local player in step with a shared room

pub mod api;
pub mod constants;
pub mod controller;
pub mod invite;
pub mod player;
pub mod playlist;
pub mod presence;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod utils;
pub mod youtube;

#[cfg(test)]
pub(crate) mod testing;
