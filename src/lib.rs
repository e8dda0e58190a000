pub mod auth;
pub mod registry;
pub mod relays;
pub mod sync;
pub mod tags;
pub mod util;
