//! Splits raw chapter text into reader items.

use crate::item::{ImageEntry, Location, ReaderItem};

/// Paragraph separator in chapter text.
const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Converts chapter text into ordered body and image items.
///
/// Paragraphs are separated by a blank line; blank paragraphs are dropped.
/// Positions start at 1 since position 0 belongs to the chapter title.
pub fn text_to_items(chapter_url: &str, chapter_index: usize, text: &str) -> Vec<ReaderItem> {
    let paragraphs: Vec<&str> = text
        .split(PARAGRAPH_SEPARATOR)
        .filter(|paragraph| !paragraph.trim().is_empty())
        .collect();
    let last_index = paragraphs.len().saturating_sub(1);

    paragraphs
        .iter()
        .enumerate()
        .map(|(index, paragraph)| {
            let location = match index {
                0 => Location::First,
                i if i == last_index => Location::Last,
                _ => Location::Middle,
            };
            paragraph_item(chapter_url, chapter_index, index + 1, paragraph, location)
        })
        .collect()
}

fn paragraph_item(
    chapter_url: &str,
    chapter_index: usize,
    position: usize,
    text: &str,
    location: Location,
) -> ReaderItem {
    match ImageEntry::from_marker(text) {
        Some(image) => ReaderItem::image(chapter_url, chapter_index, position, text, location, image),
        None => ReaderItem::body(chapter_url, chapter_index, position, text, location),
    }
}
