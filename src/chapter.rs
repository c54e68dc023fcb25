//! Book and chapter records as handed over by the persistence layer.

use serde::{Deserialize, Serialize};

/// A single chapter of a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// Unique chapter URL.
    pub url: String,

    /// URL of the book this chapter belongs to.
    pub book_url: String,

    /// Chapter title.
    pub title: String,

    /// Ordinal position within the book.
    pub position: u32,

    /// Whether the chapter has been read from start to end.
    #[serde(default)]
    pub read: bool,

    /// Last read item position within the chapter (0 = title).
    #[serde(default)]
    pub last_read_position: usize,

    /// Scroll offset of the last read item.
    #[serde(default)]
    pub last_read_offset: i32,
}

impl Chapter {
    /// Creates an unread chapter with no saved position.
    pub fn new(url: impl Into<String>, book_url: impl Into<String>, title: impl Into<String>, position: u32) -> Self {
        Self {
            url: url.into(),
            book_url: book_url.into(),
            title: title.into(),
            position,
            read: false,
            last_read_position: 0,
            last_read_offset: 0,
        }
    }
}

/// A book in the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    /// Unique book URL.
    pub url: String,

    /// Book title.
    pub title: String,

    /// URL of the chapter the reader was last on.
    #[serde(default)]
    pub last_read_chapter: Option<String>,
}

/// Stored reading cursor of a chapter, used to restore a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterState {
    pub chapter_url: String,
    pub chapter_item_position: usize,
    pub offset: i32,
}

/// Sorts chapters by their position within the book.
pub fn order_chapters(mut chapters: Vec<Chapter>) -> Vec<Chapter> {
    chapters.sort_by_key(|chapter| chapter.position);
    chapters
}
