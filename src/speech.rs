//! Text-to-speech engine contract consumed by the reader speaker.

use tokio::sync::broadcast;

/// Playback state of an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Loading,
    Playing,
    Finished,
}

/// One queued unit of speech, tagged with the item it narrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utterance {
    pub chapter_index: usize,
    pub chapter_item_index: usize,
    pub state: PlayState,
}

impl Utterance {
    pub fn new(chapter_index: usize, chapter_item_index: usize, state: PlayState) -> Self {
        Self {
            chapter_index,
            chapter_item_index,
            state,
        }
    }

    /// Same utterance with another state.
    pub fn with_state(self, state: PlayState) -> Self {
        Self { state, ..self }
    }
}

/// A selectable voice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub id: String,
    pub name: String,
    pub language: String,
}

/// A speech engine with an ordered utterance queue.
///
/// Engines publish every utterance state change on the stream returned by
/// [`SpeechEngine::subscribe`]. An utterance is removed from the queue before
/// its `Finished` state is published.
pub trait SpeechEngine: Send + Sync {
    /// Queues text for narration.
    fn speak(&self, text: &str, utterance: Utterance);

    /// Halts narration and drops every queued utterance.
    fn stop(&self);

    /// Outstanding utterances, oldest first.
    fn queued(&self) -> Vec<Utterance>;

    /// Stream of utterance state changes.
    fn subscribe(&self) -> broadcast::Receiver<Utterance>;

    /// The active playback cursor, if any utterance was ever started.
    fn current(&self) -> Option<Utterance>;

    /// Overrides the active playback cursor.
    fn set_current(&self, utterance: Utterance);

    /// Voices the engine can use.
    fn voices(&self) -> Vec<Voice>;

    /// Selects a voice by id, returning false when it is unknown.
    fn set_voice(&self, id: &str) -> bool;
}
