pub mod app;
pub mod config;
pub mod ui;

pub use app::{ChatApp, InputCommand};
pub use config::{load_preferences, save_preferences, Preferences, Scope};
pub use ui::ConsoleRenderer;
