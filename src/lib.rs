pub mod cii;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod net;
pub mod servo;
pub mod status;
pub mod synchroniser;
pub mod timeline;
pub mod traits;
pub mod wallclock;
pub mod worker;
