//! A reading session over one book.
//!
//! Wires the chapter loader, the speaker and the read tracker together:
//! narration continues into the next chapter when a chapter ends, narrated
//! paragraphs mark chapter boundaries as seen, and the reading position is
//! saved back to the repository.

use crate::chapter::{Chapter, ChapterState};
use crate::index::index_of_reader_item;
use crate::item::{Location, ReadingChapterPosStats};
use crate::loader::{ChapterLoadedKind, ChapterLoader, LoaderEvent, LoaderOptions};
use crate::read_tracker::ReadTracker;
use crate::repository::ContentRepository;
use crate::speaker::{ReaderSpeaker, SpeakerEvent};
use crate::speech::{PlayState, SpeechEngine, Utterance};
use crate::translation::Translator;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An open book.
pub struct ReaderSession {
    book_url: String,
    saves: mpsc::UnboundedSender<SaveRequest>,
    loader: Arc<ChapterLoader>,
    speaker: Arc<ReaderSpeaker>,
    read_tracker: ReadTracker,
    current_chapter: Mutex<Option<ChapterState>>,
    tasks: CancellationToken,
}

impl ReaderSession {
    /// Creates a session over `chapters`, which must be sorted by position.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        book_url: impl Into<String>,
        chapters: Vec<Chapter>,
        repository: Arc<dyn ContentRepository>,
        translator: Arc<dyn Translator>,
        tts: Arc<dyn SpeechEngine>,
        options: LoaderOptions,
    ) -> Self {
        let book_url = book_url.into();
        let loader = Arc::new(ChapterLoader::new(
            book_url.clone(),
            chapters,
            repository.clone(),
            translator,
            options,
        ));
        let speaker = Arc::new(ReaderSpeaker::new(tts.clone(), loader.subscribe_items()));
        let read_tracker = ReadTracker::new(repository.clone());
        let tasks = CancellationToken::new();

        let (saves, requests) = mpsc::unbounded_channel();
        tokio::spawn(save_positions(repository, book_url.clone(), requests));

        tokio::spawn(continue_at_chapter_end(
            loader.clone(),
            speaker.clone(),
            speaker.subscribe(),
            tasks.clone(),
        ));
        tokio::spawn(follow_narration(
            NarrationFollower {
                saves: saves.clone(),
                loader: loader.clone(),
                speaker: speaker.clone(),
                read_tracker: read_tracker.clone(),
            },
            tts.subscribe(),
            tasks.clone(),
        ));

        Self {
            book_url,
            saves,
            loader,
            speaker,
            read_tracker,
            current_chapter: Mutex::new(None),
            tasks,
        }
    }

    pub fn book_url(&self) -> &str {
        &self.book_url
    }

    pub fn loader(&self) -> &ChapterLoader {
        &self.loader
    }

    pub fn speaker(&self) -> &ReaderSpeaker {
        &self.speaker
    }

    /// Opens the book at `chapter_url`.
    ///
    /// An unknown chapter is reported through [`LoaderEvent::InvalidChapter`].
    pub fn open(&self, chapter_url: &str) -> bool {
        match self.loader.chapter_index_of(chapter_url) {
            Some(chapter_index) => self.open_index(chapter_index),
            None => {
                warn!("Chapter {} is not part of {}", chapter_url, self.book_url);
                self.loader.try_load_initial(self.loader.chapters().len())
            }
        }
    }

    /// Opens the book at the chapter with index `chapter_index`.
    pub fn open_index(&self, chapter_index: usize) -> bool {
        if let Some(chapter) = self.loader.chapters().get(chapter_index) {
            *self.current_chapter.lock() = Some(ChapterState {
                chapter_url: chapter.url.clone(),
                chapter_item_position: chapter.last_read_position,
                offset: chapter.last_read_offset,
            });
        }
        self.loader.try_load_initial(chapter_index)
    }

    /// Drops everything loaded and stops narration.
    pub fn reload(&self) {
        self.loader.reload();
        self.speaker.stop();
    }

    /// Starts narration at the item with list index `item_index`.
    pub fn start_speaker(&self, item_index: usize) {
        let items = self.loader.items();
        let Some(item) = items.get(item_index) else {
            return;
        };
        self.speaker.start();
        self.speaker
            .read_chapter_starting_from_item_index(item_index, item.chapter_index);
    }

    /// Narrates the chapter after the current one, loading it when needed.
    pub async fn play_next_chapter(&self) {
        let next = self.speaker.current().map_or(0, |u| u.chapter_index + 1);

        self.speaker.stop();
        if !self.loader.is_chapter_index_valid(next) {
            debug!("No chapter after {}", next.saturating_sub(1));
            return;
        }

        self.speaker.start();
        if self.ensure_loaded(next).await {
            self.speaker.read_chapter_starting_from_start(next);
        }
    }

    /// Narrates the current chapter from its title, or the previous one when
    /// already at the title.
    pub async fn play_previous_chapter(&self) {
        let target = match self.speaker.current() {
            Some(current) if current.chapter_item_index == 0 => current.chapter_index.checked_sub(1),
            Some(current) => Some(current.chapter_index),
            None => None,
        };

        self.speaker.stop();
        let Some(target) = target.filter(|&index| self.loader.is_chapter_index_valid(index)) else {
            debug!("No chapter before the current one");
            return;
        };

        self.speaker.start();
        if self.ensure_loaded(target).await {
            self.speaker.read_chapter_starting_from_start(target);
        }
    }

    /// Loads `chapter_index` unless it is already loaded.
    async fn ensure_loaded(&self, chapter_index: usize) -> bool {
        // Subscribed before checking so a load finishing in between is seen
        let mut events = self.loader.subscribe();
        if self.loader.is_chapter_index_loaded(chapter_index) {
            return true;
        }

        let kind = if chapter_index > 0 && self.loader.is_chapter_index_loaded(chapter_index - 1) {
            self.loader.try_load_next();
            ChapterLoadedKind::Next
        } else if self.loader.is_chapter_index_loaded(chapter_index + 1) {
            self.loader.try_load_previous();
            ChapterLoadedKind::Previous
        } else {
            self.loader.try_load_initial(chapter_index);
            ChapterLoadedKind::Initial
        };

        tokio::select! {
            biased;
            _ = self.tasks.cancelled() => false,
            loaded = wait_for_chapter(&mut events, chapter_index, kind) => loaded,
        }
    }

    /// Reports that the first paragraph of a chapter became visible.
    pub fn mark_chapter_start_seen(&self, chapter_url: &str) -> JoinHandle<()> {
        self.read_tracker.set_read_start(chapter_url)
    }

    /// Reports that the last paragraph of a chapter became visible.
    pub fn mark_chapter_end_seen(&self, chapter_url: &str) -> JoinHandle<()> {
        self.read_tracker.set_read_end(chapter_url)
    }

    pub fn current_chapter(&self) -> Option<ChapterState> {
        self.current_chapter.lock().clone()
    }

    /// Updates the reading cursor reported by the view.
    ///
    /// Moving to another chapter saves both positions unless narration is
    /// active, in which case the narrated position is saved instead.
    pub fn set_current_chapter(&self, state: ChapterState) -> Option<oneshot::Receiver<()>> {
        let old = self.current_chapter.lock().replace(state.clone());
        let old = old?;
        if old.chapter_url == state.chapter_url || self.speaker.is_playing() {
            return None;
        }
        Some(self.save_position(state, Some(old)))
    }

    /// Persists the reading position in the background.
    ///
    /// Saves are written one at a time in the order they were requested; the
    /// returned receiver completes once this one is written.
    pub fn save_position(&self, new: ChapterState, old: Option<ChapterState>) -> oneshot::Receiver<()> {
        queue_save(&self.saves, new, old)
    }

    /// Reading progress of the item at `item_index` within its chapter.
    pub fn reading_stats(&self, item_index: usize) -> Option<ReadingChapterPosStats> {
        self.loader.item_context_at(item_index)
    }

    /// Saves the final position and stops every background task.
    pub async fn close(&self) {
        let position = if self.speaker.is_playing() {
            self.speaker.current().and_then(|u| self.narrated_state(u))
        } else {
            self.current_chapter()
        };

        self.speaker.stop();
        self.loader.close();

        if let Some(state) = position {
            let _ = self.save_position(state, None).await;
        }
        self.tasks.cancel();
        info!("Closed {}", self.book_url);
    }

    fn narrated_state(&self, utterance: Utterance) -> Option<ChapterState> {
        let chapter = self.loader.chapters().get(utterance.chapter_index)?;
        Some(ChapterState {
            chapter_url: chapter.url.clone(),
            chapter_item_position: utterance.chapter_item_index,
            offset: 0,
        })
    }
}

impl Drop for ReaderSession {
    fn drop(&mut self) {
        self.tasks.cancel();
        self.loader.close();
    }
}

/// A position save waiting for the writer task.
struct SaveRequest {
    new: ChapterState,
    old: Option<ChapterState>,
    done: oneshot::Sender<()>,
}

fn queue_save(
    saves: &mpsc::UnboundedSender<SaveRequest>,
    new: ChapterState,
    old: Option<ChapterState>,
) -> oneshot::Receiver<()> {
    let (done, saved) = oneshot::channel();
    if let Err(e) = saves.send(SaveRequest { new, old, done }) {
        warn!("Position writer stopped, dropping save of {}", e.0.new.chapter_url);
    }
    saved
}

/// Writes queued positions one at a time until every sender is gone.
async fn save_positions(
    repository: Arc<dyn ContentRepository>,
    book_url: String,
    mut requests: mpsc::UnboundedReceiver<SaveRequest>,
) {
    while let Some(request) = requests.recv().await {
        save_reading_position(repository.as_ref(), &book_url, &request.new, request.old.as_ref()).await;
        let _ = request.done.send(());
    }
}

/// Writes the last read chapter of the book and both chapter positions.
async fn save_reading_position(
    repository: &dyn ContentRepository,
    book_url: &str,
    new: &ChapterState,
    old: Option<&ChapterState>,
) {
    if let Err(e) = repository.update_last_read_chapter(book_url, &new.chapter_url).await {
        warn!("Failed to save last read chapter of {}: {}", book_url, e);
    }
    if let Some(old) = old {
        if let Err(e) = repository
            .update_chapter_position(&old.chapter_url, old.chapter_item_position, old.offset)
            .await
        {
            warn!("Failed to save position of {}: {}", old.chapter_url, e);
        }
    }
    if let Err(e) = repository
        .update_chapter_position(&new.chapter_url, new.chapter_item_position, new.offset)
        .await
    {
        warn!("Failed to save position of {}: {}", new.chapter_url, e);
    }
}

/// Waits until `chapter_index` is loaded through requests of `kind`.
///
/// Next and previous loads extend the list one chapter at a time, so a load
/// beyond `chapter_index` in the same direction means it is loaded too.
async fn wait_for_chapter(
    events: &mut broadcast::Receiver<LoaderEvent>,
    chapter_index: usize,
    kind: ChapterLoadedKind,
) -> bool {
    loop {
        match events.recv().await {
            Ok(LoaderEvent::ChapterLoaded(loaded)) if loaded.kind == kind => {
                let reached = match kind {
                    ChapterLoadedKind::Next => loaded.chapter_index >= chapter_index,
                    ChapterLoadedKind::Previous => loaded.chapter_index <= chapter_index,
                    ChapterLoadedKind::Initial => loaded.chapter_index == chapter_index,
                };
                if reached {
                    return true;
                }
                if kind == ChapterLoadedKind::Initial {
                    return false;
                }
            }
            Ok(LoaderEvent::ChapterLoaded(loaded)) if loaded.kind == ChapterLoadedKind::Initial => return false,
            Ok(LoaderEvent::InvalidChapter) => return false,
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return false,
        }
    }
}

/// Keeps narrating into the next chapter whenever a chapter runs out.
async fn continue_at_chapter_end(
    loader: Arc<ChapterLoader>,
    speaker: Arc<ReaderSpeaker>,
    mut events: broadcast::Receiver<SpeakerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        };

        let SpeakerEvent::ReachedChapterEnd(chapter_index) = event else {
            continue;
        };
        if !speaker.is_playing() {
            continue;
        }
        if loader.is_last_chapter(chapter_index) {
            info!("Finished narrating the book");
            continue;
        }

        let next = chapter_index + 1;
        let mut loaded = loader.subscribe();
        if loader.is_chapter_index_loaded(next) {
            speaker.read_chapter_starting_from_start(next);
            continue;
        }

        loader.try_load_next();
        let speaker = speaker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ready = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                ready = wait_for_chapter(&mut loaded, next, ChapterLoadedKind::Next) => ready,
            };
            if ready && speaker.is_playing() {
                speaker.read_chapter_starting_from_start(next);
            }
        });
    }
}

struct NarrationFollower {
    saves: mpsc::UnboundedSender<SaveRequest>,
    loader: Arc<ChapterLoader>,
    speaker: Arc<ReaderSpeaker>,
    read_tracker: ReadTracker,
}

impl NarrationFollower {
    fn on_playing(&self, utterance: Utterance) {
        let items = self.loader.items();
        let Some(index) = index_of_reader_item(&items, utterance.chapter_index, utterance.chapter_item_index) else {
            return;
        };
        let item = &items[index];

        match item.location() {
            Some(Location::First) => {
                self.read_tracker.set_read_start(&item.chapter_url);
            }
            Some(Location::Last) => {
                self.read_tracker.set_read_end(&item.chapter_url);
            }
            Some(Location::Middle) | None => {}
        }

        if self.speaker.is_playing() {
            let state = ChapterState {
                chapter_url: item.chapter_url.clone(),
                chapter_item_position: utterance.chapter_item_index,
                offset: 0,
            };
            // Completion is not awaited; the writer keeps saves in order
            let _ = queue_save(&self.saves, state, None);
        }
    }
}

/// Marks chapter boundaries and saves the position while narrating.
async fn follow_narration(
    follower: NarrationFollower,
    mut utterances: broadcast::Receiver<Utterance>,
    cancel: CancellationToken,
) {
    loop {
        let utterance = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = utterances.recv() => match received {
                Ok(utterance) => utterance,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        };
        if utterance.state == PlayState::Playing {
            follower.on_playing(utterance);
        }
    }
}
