pub mod camera;
pub mod capture;
pub mod channel;
pub mod classifier;
pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod fire;
pub mod gate;
pub mod incident;
pub mod mode;
pub mod movement;
pub mod paths;
pub mod store;
pub mod surveillance;

pub use channel::*;
pub use config::Config;
pub use console::*;
pub use error::*;
pub use store::*;
