//! Narration of the reader list through a speech engine.
//!
//! The speaker keeps a small buffer of utterances queued on the engine and
//! refills it as utterances finish. It never mutates the item list; it reads
//! the latest snapshot published by the chapter loader.

use crate::index::index_of_reader_item;
use crate::item::{ItemsSnapshot, ReaderItem};
use crate::speech::{PlayState, SpeechEngine, Utterance, Voice};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Utterances added per refill; twice this many are queued when reading starts.
pub const HALF_BUFFER: usize = 2;

/// Capacity of the speaker event channel.
const EVENT_CAPACITY: usize = 64;

/// Notifications published by the speaker.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeakerEvent {
    /// Narration ran out of items in the chapter.
    ReachedChapterEnd(usize),
    /// Playback was requested with no cursor; the view picks the item.
    StartReadingFromFirstVisibleItem,
    /// The view should bring this item into sight.
    ScrollToItem(ReaderItem),
}

/// Everything a narration step needs; cheap to clone into the refill task.
#[derive(Clone)]
struct Narration {
    tts: Arc<dyn SpeechEngine>,
    items: watch::Receiver<ItemsSnapshot>,
    events: broadcast::Sender<SpeakerEvent>,
}

impl Narration {
    fn snapshot(&self) -> ItemsSnapshot {
        self.items.borrow().clone()
    }

    fn emit(&self, event: SpeakerEvent) {
        let _ = self.events.send(event);
    }

    fn on_finished(&self, utterance: Utterance) {
        let queued = self.tts.queued();
        match queued.len() {
            HALF_BUFFER => {
                if let Some(last) = queued.last() {
                    self.read_chapter_next_chunk(last.chapter_index, last.chapter_item_index, HALF_BUFFER);
                }
            }
            0 => {
                debug!("Reached end of chapter {}", utterance.chapter_index);
                self.emit(SpeakerEvent::ReachedChapterEnd(utterance.chapter_index));
            }
            _ => {}
        }
    }

    fn read_chapter_starting_from_chapter_item(&self, chapter_index: usize, chapter_item_index: usize) {
        let items = self.snapshot();
        match index_of_reader_item(&items, chapter_index, chapter_item_index) {
            Some(item_index) => self.read_chapter_starting_from_item_index(item_index, chapter_index),
            None => self.emit(SpeakerEvent::ReachedChapterEnd(chapter_index)),
        }
    }

    fn read_chapter_starting_from_item_index(&self, item_index: usize, chapter_index: usize) {
        let items = self.snapshot();
        let next_items = chapter_next_items(&items, item_index, chapter_index, HALF_BUFFER * 2);

        let Some(first) = next_items.first() else {
            self.emit(SpeakerEvent::ReachedChapterEnd(chapter_index));
            return;
        };
        if let Some(position) = first.chapter_item_position() {
            self.tts
                .set_current(Utterance::new(first.chapter_index, position, PlayState::Loading));
        }

        for item in next_items {
            self.speak_item(item);
        }
    }

    fn read_chapter_next_chunk(&self, chapter_index: usize, chapter_item_index: usize, quantity: usize) {
        let items = self.snapshot();
        let Some(item_index) = index_of_reader_item(&items, chapter_index, chapter_item_index) else {
            return;
        };
        for item in chapter_next_items(&items, item_index + 1, chapter_index, quantity) {
            self.speak_item(item);
        }
    }

    fn speak_item(&self, item: &ReaderItem) {
        let (Some(text), Some(position)) = (item.text_to_display(), item.chapter_item_position()) else {
            return;
        };
        self.tts
            .speak(text, Utterance::new(item.chapter_index, position, PlayState::Playing));
    }
}

/// Up to `quantity` narratable items of `chapter_index` from `item_index` on.
fn chapter_next_items(
    items: &[ReaderItem],
    item_index: usize,
    chapter_index: usize,
    quantity: usize,
) -> Vec<&ReaderItem> {
    let start = item_index.min(items.len().saturating_sub(1));
    items
        .iter()
        .skip(start)
        .filter(|item| item.is_text())
        .take_while(|item| item.chapter_index == chapter_index)
        .take(quantity)
        .collect()
}

struct SpeakerState {
    playing: bool,
    update_task: Option<CancellationToken>,
}

/// Reads the chapters of the reader list aloud.
pub struct ReaderSpeaker {
    narration: Narration,
    state: Arc<Mutex<SpeakerState>>,
}

impl ReaderSpeaker {
    pub fn new(tts: Arc<dyn SpeechEngine>, items: watch::Receiver<ItemsSnapshot>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            narration: Narration { tts, items, events },
            state: Arc::new(Mutex::new(SpeakerState {
                playing: false,
                update_task: None,
            })),
        }
    }

    /// Receives speaker events.
    pub fn subscribe(&self) -> broadcast::Receiver<SpeakerEvent> {
        self.narration.events.subscribe()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Current playback cursor of the engine.
    pub fn current(&self) -> Option<Utterance> {
        self.narration.tts.current()
    }

    pub fn voices(&self) -> Vec<Voice> {
        self.narration.tts.voices()
    }

    /// Marks playback active and starts refilling the engine queue.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.playing = true;
        if let Some(task) = state.update_task.take() {
            task.cancel();
        }

        let token = CancellationToken::new();
        state.update_task = Some(token.clone());

        let narration = self.narration.clone();
        let speaker_state = self.state.clone();
        let mut utterances = narration.tts.subscribe();
        tokio::spawn(async move {
            loop {
                let utterance = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = utterances.recv() => match received {
                        Ok(utterance) => utterance,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Speaker skipped {} utterance updates", skipped);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if utterance.state != PlayState::Finished {
                    continue;
                }
                // Refills under the state lock so a concurrent stop either
                // waits for it or cancels it first
                let _state = speaker_state.lock();
                if token.is_cancelled() {
                    break;
                }
                narration.on_finished(utterance);
            }
        });
    }

    /// Stops playback and drops every queued utterance.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.playing = false;
            if let Some(task) = state.update_task.take() {
                task.cancel();
            }
        }
        self.narration.tts.stop();
    }

    /// Toggles playback, resuming from the engine cursor when there is one.
    pub fn set_playing(&self, playing: bool) {
        if !playing {
            self.stop();
            return;
        }
        self.start();
        match self.narration.tts.current() {
            Some(current) => self
                .narration
                .read_chapter_starting_from_chapter_item(current.chapter_index, current.chapter_item_index),
            None => self.narration.emit(SpeakerEvent::StartReadingFromFirstVisibleItem),
        }
    }

    /// Restarts playback and lets the view choose where to read from.
    pub fn play_first_visible_item(&self) {
        self.stop();
        self.start();
        self.narration.emit(SpeakerEvent::StartReadingFromFirstVisibleItem);
    }

    /// Switches voice; active playback restarts at the current item.
    pub fn on_select_voice(&self, voice: &Voice) {
        if !self.narration.tts.set_voice(&voice.id) {
            warn!("Unknown voice {}", voice.id);
        }
        if !self.is_playing() {
            return;
        }
        self.stop();
        self.start();
        if let Some(current) = self.narration.tts.current() {
            self.narration
                .read_chapter_starting_from_chapter_item(current.chapter_index, current.chapter_item_index);
        }
    }

    pub fn read_chapter_starting_from_start(&self, chapter_index: usize) {
        self.narration.read_chapter_starting_from_chapter_item(chapter_index, 0);
    }

    pub fn read_chapter_starting_from_chapter_item(&self, chapter_index: usize, chapter_item_index: usize) {
        self.narration
            .read_chapter_starting_from_chapter_item(chapter_index, chapter_item_index);
    }

    pub fn read_chapter_starting_from_item_index(&self, item_index: usize, chapter_index: usize) {
        self.narration
            .read_chapter_starting_from_item_index(item_index, chapter_index);
    }

    /// Skips ahead to the next positioned item.
    pub fn play_next_item(&self) {
        let items = self.narration.snapshot();
        let Some(current_index) = self.current_item_index(&items) else {
            return;
        };
        let Some(next_index) = items
            .iter()
            .enumerate()
            .skip(current_index + 1)
            .find(|(_, item)| item.is_position())
            .map(|(index, _)| index)
        else {
            return;
        };
        self.play_item_at(&items, next_index);
    }

    /// Steps back to the previous positioned item.
    pub fn play_previous_item(&self) {
        let items = self.narration.snapshot();
        let Some(current_index) = self.current_item_index(&items) else {
            return;
        };
        let Some(previous_index) = items[..current_index].iter().rposition(|item| item.is_position()) else {
            return;
        };
        self.play_item_at(&items, previous_index);
    }

    /// Asks the view to show the item being narrated.
    pub fn scroll_to_active_item(&self) {
        let items = self.narration.snapshot();
        if let Some(index) = self.current_item_index(&items) {
            self.narration.emit(SpeakerEvent::ScrollToItem(items[index].clone()));
        }
    }

    fn current_item_index(&self, items: &[ReaderItem]) -> Option<usize> {
        let current = self.narration.tts.current()?;
        index_of_reader_item(items, current.chapter_index, current.chapter_item_index)
    }

    fn play_item_at(&self, items: &[ReaderItem], item_index: usize) {
        let item = items[item_index].clone();
        self.stop();
        self.start();
        self.narration
            .read_chapter_starting_from_item_index(item_index, item.chapter_index);
        self.narration.emit(SpeakerEvent::ScrollToItem(item));
    }
}

impl Drop for ReaderSpeaker {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().update_task.take() {
            task.cancel();
        }
    }
}
