//! Renderable reader items and the positional types built around them.
//!
//! The reader surface is one flat list of [`ReaderItem`]s. Every item belongs
//! to a chapter (by index into the ordered chapter list); only titles, body
//! paragraphs and images carry a position inside that chapter.

use crate::chapter::Chapter;
use regex::Regex;
use std::sync::{Arc, LazyLock};

/// Regex for the inline image marker embedded in chapter text.
static IMAGE_MARKER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*<img\s+yrel="([0-9]*\.?[0-9]+)"\s*>([^<]*)</img>\s*$"#)
        .expect("Invalid IMAGE_MARKER_REGEX")
});

/// Immutable view of the item list shared with readers of the loader.
pub type ItemsSnapshot = Arc<Vec<ReaderItem>>;

/// Where a paragraph sits within its chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    First,
    Middle,
    Last,
}

/// An image embedded in chapter text.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
    /// Image path, relative to the book.
    pub path: String,
    /// Height relative to width.
    pub y_rel: f32,
}

impl ImageEntry {
    /// Parses an inline image marker, returning `None` for ordinary text.
    pub fn from_marker(text: &str) -> Option<Self> {
        let captures = IMAGE_MARKER_REGEX.captures(text)?;
        let y_rel = captures[1].parse::<f32>().ok()?;
        Some(Self {
            path: captures[2].trim().to_string(),
            y_rel,
        })
    }

    /// Renders the inline image marker for this entry.
    pub fn to_marker(&self) -> String {
        format!(r#"<img yrel="{:.2}">{}</img>"#, self.y_rel, self.path)
    }
}

/// Kind-specific payload of a reader item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Divider,
    Title {
        chapter_item_position: usize,
        text: String,
        text_translated: Option<String>,
    },
    Body {
        chapter_item_position: usize,
        text: String,
        text_translated: Option<String>,
        location: Location,
    },
    Image {
        chapter_item_position: usize,
        text: String,
        location: Location,
        image: ImageEntry,
    },
    Progressbar,
    Error {
        message: String,
    },
    BookStart,
    BookEnd,
    TranslationAttribution,
    Translating {
        source_language: String,
        target_language: String,
    },
    Padding,
}

/// One renderable unit of the reader surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderItem {
    /// URL of the owning chapter.
    pub chapter_url: String,
    /// Index of the owning chapter in the ordered chapter list.
    pub chapter_index: usize,
    /// What this item is.
    pub kind: ItemKind,
}

impl ReaderItem {
    fn new(chapter_url: &str, chapter_index: usize, kind: ItemKind) -> Self {
        Self {
            chapter_url: chapter_url.to_string(),
            chapter_index,
            kind,
        }
    }

    pub fn divider(chapter_url: &str, chapter_index: usize) -> Self {
        Self::new(chapter_url, chapter_index, ItemKind::Divider)
    }

    /// Chapter title; always at chapter item position 0.
    pub fn title(chapter_url: &str, chapter_index: usize, text: &str, text_translated: Option<String>) -> Self {
        Self::new(
            chapter_url,
            chapter_index,
            ItemKind::Title {
                chapter_item_position: 0,
                text: text.to_string(),
                text_translated,
            },
        )
    }

    pub fn body(
        chapter_url: &str,
        chapter_index: usize,
        chapter_item_position: usize,
        text: &str,
        location: Location,
    ) -> Self {
        Self::new(
            chapter_url,
            chapter_index,
            ItemKind::Body {
                chapter_item_position,
                text: text.to_string(),
                text_translated: None,
                location,
            },
        )
    }

    pub fn image(
        chapter_url: &str,
        chapter_index: usize,
        chapter_item_position: usize,
        text: &str,
        location: Location,
        image: ImageEntry,
    ) -> Self {
        Self::new(
            chapter_url,
            chapter_index,
            ItemKind::Image {
                chapter_item_position,
                text: text.to_string(),
                location,
                image,
            },
        )
    }

    pub fn progressbar(chapter_url: &str, chapter_index: usize) -> Self {
        Self::new(chapter_url, chapter_index, ItemKind::Progressbar)
    }

    pub fn error(chapter_url: &str, chapter_index: usize, message: &str) -> Self {
        Self::new(
            chapter_url,
            chapter_index,
            ItemKind::Error {
                message: message.to_string(),
            },
        )
    }

    pub fn book_start(chapter_url: &str, chapter_index: usize) -> Self {
        Self::new(chapter_url, chapter_index, ItemKind::BookStart)
    }

    pub fn book_end(chapter_url: &str, chapter_index: usize) -> Self {
        Self::new(chapter_url, chapter_index, ItemKind::BookEnd)
    }

    pub fn translation_attribution(chapter_url: &str, chapter_index: usize) -> Self {
        Self::new(chapter_url, chapter_index, ItemKind::TranslationAttribution)
    }

    pub fn translating(chapter_url: &str, chapter_index: usize, source_language: &str, target_language: &str) -> Self {
        Self::new(
            chapter_url,
            chapter_index,
            ItemKind::Translating {
                source_language: source_language.to_string(),
                target_language: target_language.to_string(),
            },
        )
    }

    pub fn padding(chapter_url: &str, chapter_index: usize) -> Self {
        Self::new(chapter_url, chapter_index, ItemKind::Padding)
    }

    /// Position within the chapter, for titles, bodies and images.
    pub fn chapter_item_position(&self) -> Option<usize> {
        match &self.kind {
            ItemKind::Title { chapter_item_position, .. }
            | ItemKind::Body { chapter_item_position, .. }
            | ItemKind::Image { chapter_item_position, .. } => Some(*chapter_item_position),
            ItemKind::Divider
            | ItemKind::Progressbar
            | ItemKind::Error { .. }
            | ItemKind::BookStart
            | ItemKind::BookEnd
            | ItemKind::TranslationAttribution
            | ItemKind::Translating { .. }
            | ItemKind::Padding => None,
        }
    }

    /// Returns true for items that carry a chapter item position.
    pub fn is_position(&self) -> bool {
        self.chapter_item_position().is_some()
    }

    /// Returns true for the items narrated by the speaker.
    pub fn is_text(&self) -> bool {
        matches!(self.kind, ItemKind::Title { .. } | ItemKind::Body { .. })
    }

    /// Paragraph location, for bodies and images.
    pub fn location(&self) -> Option<Location> {
        match &self.kind {
            ItemKind::Body { location, .. } | ItemKind::Image { location, .. } => Some(*location),
            _ => None,
        }
    }

    /// Text to show or speak: the translation when present, else the original.
    pub fn text_to_display(&self) -> Option<&str> {
        match &self.kind {
            ItemKind::Title { text, text_translated, .. } | ItemKind::Body { text, text_translated, .. } => {
                Some(text_translated.as_deref().unwrap_or(text))
            }
            _ => None,
        }
    }

    /// Returns a copy of a title or body with the given translation attached.
    pub fn with_translation(mut self, translation: Option<String>) -> Self {
        match &mut self.kind {
            ItemKind::Title { text_translated, .. } | ItemKind::Body { text_translated, .. } => {
                *text_translated = translation;
            }
            _ => {}
        }
        self
    }
}

/// A restorable scroll cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemPosition {
    pub chapter_index: usize,
    pub chapter_item_index: usize,
    pub item_offset: i32,
}

/// Recorded once a chapter finishes loading.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterStats {
    pub chapter: Chapter,
    pub items_count: usize,
    pub ordered_chapters_index: usize,
}

/// Reading progress of one item within its chapter and the book.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingChapterPosStats {
    pub chapter_index: usize,
    pub chapter_count: usize,
    pub chapter_item_position: usize,
    pub chapter_items_count: usize,
    pub chapter_title: String,
    pub chapter_url: String,
}

impl ReadingChapterPosStats {
    /// Percentage of the chapter read, in `0.0..=100.0`.
    pub fn chapter_read_percentage(&self) -> f32 {
        if self.chapter_items_count == 0 {
            return 0.0;
        }
        let ratio = self.chapter_item_position as f32 / self.chapter_items_count as f32;
        (ratio * 100.0).clamp(0.0, 100.0)
    }
}
