//! Shiori - a chapter-streaming book reader core.
//!
//! This library provides functionality for:
//! - Loading chapters incrementally around the reading position
//! - Narrating chapters through a speech engine with a refilling buffer
//! - Tracking which chapters have been read and where reading stopped

pub mod chapter;
pub mod config;
pub mod console;
pub mod error;
pub mod index;
pub mod item;
pub mod loader;
pub mod narrator;
pub mod read_tracker;
pub mod repository;
pub mod segmenter;
pub mod session;
pub mod speaker;
pub mod speech;
pub mod translation;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use chapter::{Book, Chapter, ChapterState};
pub use config::Config;
pub use console::Console;
pub use error::{ConfigError, ContentError, LoaderError};
pub use item::{ItemKind, ReaderItem};
pub use loader::{ChapterLoader, LoaderEvent, LoaderOptions};
pub use narrator::ConsoleNarrator;
pub use repository::{ContentRepository, LocalLibrary};
pub use session::ReaderSession;
pub use speaker::{ReaderSpeaker, SpeakerEvent};
pub use speech::{SpeechEngine, Utterance};
pub use translation::{NoTranslation, Translator};
