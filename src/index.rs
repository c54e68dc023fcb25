//! Lookup of an item in the reader list by chapter and item position.
//!
//! The list is ordered by chapter index and, within a chapter, by item
//! position. Structural items (dividers, progress bars, markers) carry a
//! chapter index but no item position, so the binary search has to step
//! over them.

use crate::item::ReaderItem;
use std::cmp::Ordering;

/// List size from which the binary search is used.
pub const BINARY_SEARCH_THRESHOLD: usize = 128;

/// Finds the list index of the positioned item `(chapter_index, chapter_item_position)`.
pub fn index_of_reader_item(items: &[ReaderItem], chapter_index: usize, chapter_item_position: usize) -> Option<usize> {
    if items.len() < BINARY_SEARCH_THRESHOLD {
        index_of_reader_item_linear(items, chapter_index, chapter_item_position)
    } else {
        index_of_reader_item_binary(items, chapter_index, chapter_item_position)
    }
}

/// O(n) search.
pub fn index_of_reader_item_linear(
    items: &[ReaderItem],
    chapter_index: usize,
    chapter_item_position: usize,
) -> Option<usize> {
    items.iter().position(|item| {
        item.chapter_index == chapter_index && item.chapter_item_position() == Some(chapter_item_position)
    })
}

/// O(log n) search.
pub fn index_of_reader_item_binary(
    items: &[ReaderItem],
    chapter_index: usize,
    chapter_item_position: usize,
) -> Option<usize> {
    let mut low = 0;
    let mut high = items.len();

    while low < high {
        let mut mid = low + (high - low) / 2;
        let ordering = match items[mid].chapter_index.cmp(&chapter_index) {
            Ordering::Equal => match items[mid].chapter_item_position() {
                Some(position) => position.cmp(&chapter_item_position),
                None => {
                    // Use the next positioned item of the same chapter as the midpoint
                    let next = items[mid..high]
                        .iter()
                        .take_while(|item| item.chapter_index == chapter_index)
                        .enumerate()
                        .find_map(|(offset, item)| item.chapter_item_position().map(|p| (offset, p)));

                    match next {
                        Some((offset, position)) => {
                            mid += offset;
                            position.cmp(&chapter_item_position)
                        }
                        None => Ordering::Greater,
                    }
                }
            },
            other => other,
        };

        match ordering {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => return Some(mid),
        }
    }

    None
}
