pub mod config;
pub mod report;
pub mod tts;
pub mod video;

pub use config::*;
pub use report::*;
pub use tts::*;
pub use video::*;
