//! Incremental, bidirectional chapter loading.
//!
//! The loader owns the flat list of [`ReaderItem`]s shown by the reader. Load
//! requests are deduplicated per kind and handled one at a time by a single
//! consumer task, which is the only writer of the list. Every mutation is
//! published as an immutable snapshot on a watch channel.
//!
//! A [`ChapterLoader::reload`] starts a new generation: the previous consumer
//! is cancelled and nothing it produces afterwards is published.

use crate::chapter::{Book, Chapter, ChapterState};
use crate::error::LoaderError;
use crate::index::index_of_reader_item;
use crate::item::{ChapterStats, ItemKind, ItemPosition, ItemsSnapshot, ReaderItem, ReadingChapterPosStats};
use crate::repository::ContentRepository;
use crate::segmenter::text_to_items;
use crate::translation::{Translator, translate_if_active};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of paragraphs translated concurrently.
pub const DEFAULT_TRANSLATION_CONCURRENCY: usize = 4;

/// Capacity of the loader event channel.
const EVENT_CAPACITY: usize = 64;

/// Coarse state of the reader surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    InitialLoad,
    Loading,
    Idle,
}

/// Kind of a load request; at most one of each is queued or running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadRequestKind {
    Initial,
    RestartInitial,
    Previous,
    Next,
}

#[derive(Debug, Clone)]
enum LoadRequest {
    Initial { chapter_index: usize },
    RestartInitial(ChapterState),
    Previous,
    Next,
}

impl LoadRequest {
    fn kind(&self) -> LoadRequestKind {
        match self {
            LoadRequest::Initial { .. } => LoadRequestKind::Initial,
            LoadRequest::RestartInitial(_) => LoadRequestKind::RestartInitial,
            LoadRequest::Previous => LoadRequestKind::Previous,
            LoadRequest::Next => LoadRequestKind::Next,
        }
    }
}

/// Which request produced a loaded chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterLoadedKind {
    Previous,
    Next,
    Initial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterLoaded {
    pub chapter_index: usize,
    pub kind: ChapterLoadedKind,
}

/// Notifications published by the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderEvent {
    /// A chapter finished loading.
    ChapterLoaded(ChapterLoaded),
    /// Where the view should scroll to after an initial load.
    InitialPosition(ItemPosition),
    /// The requested chapter does not exist.
    InvalidChapter,
}

/// What the view keeps in place while the list is mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorMode {
    /// Keep the list scrolled to its start.
    Start,
    /// Keep the last visible item at the same screen offset.
    LastVisible,
}

/// Hook around list mutations that preserves the visual scroll position.
pub trait ScrollAnchor: Send + Sync {
    /// Called before the list is mutated.
    fn capture(&self, mode: AnchorMode);

    /// Called after the mutated list has been published.
    fn restore(&self, mode: AnchorMode);
}

/// Anchor for surfaces without a scroll position.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAnchor;

impl ScrollAnchor for NoAnchor {
    fn capture(&self, _mode: AnchorMode) {}

    fn restore(&self, _mode: AnchorMode) {}
}

/// Optional loader collaborators.
pub struct LoaderOptions {
    pub anchor: Arc<dyn ScrollAnchor>,
    pub translation_concurrency: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            anchor: Arc::new(NoAnchor),
            translation_concurrency: DEFAULT_TRANSLATION_CONCURRENCY,
        }
    }
}

/// Mutable state shared between the loader handle and its consumer task.
struct LoaderState {
    generation: u64,
    reader_state: ReaderState,
    pending: HashSet<LoadRequestKind>,
    requests: mpsc::UnboundedSender<LoadRequest>,
    cancel: CancellationToken,
    stats: HashMap<String, ChapterStats>,
    loaded: HashSet<String>,
}

struct LoaderShared {
    book_url: String,
    chapters: Arc<[Chapter]>,
    repository: Arc<dyn ContentRepository>,
    translator: Arc<dyn Translator>,
    anchor: Arc<dyn ScrollAnchor>,
    translation_concurrency: usize,
    items_tx: watch::Sender<ItemsSnapshot>,
    events: broadcast::Sender<LoaderEvent>,
    state: Mutex<LoaderState>,
}

/// Loads the chapters of one book around the reading position.
pub struct ChapterLoader {
    shared: Arc<LoaderShared>,
}

impl ChapterLoader {
    /// Creates a loader over `chapters`, which must be sorted by position.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        book_url: impl Into<String>,
        chapters: Vec<Chapter>,
        repository: Arc<dyn ContentRepository>,
        translator: Arc<dyn Translator>,
        options: LoaderOptions,
    ) -> Self {
        let (items_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (requests, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let shared = Arc::new(LoaderShared {
            book_url: book_url.into(),
            chapters: chapters.into(),
            repository,
            translator,
            anchor: options.anchor,
            translation_concurrency: options.translation_concurrency.max(1),
            items_tx,
            events,
            state: Mutex::new(LoaderState {
                generation: 0,
                reader_state: ReaderState::InitialLoad,
                pending: HashSet::new(),
                requests,
                cancel: cancel.clone(),
                stats: HashMap::new(),
                loaded: HashSet::new(),
            }),
        });

        Worker::spawn(shared.clone(), 0, cancel, receiver);
        Self { shared }
    }

    /// Requests the initial load of the chapter at `chapter_index`.
    pub fn try_load_initial(&self, chapter_index: usize) -> bool {
        self.enqueue(LoadRequest::Initial { chapter_index })
    }

    /// Requests an initial load restoring a stored reading cursor.
    pub fn try_load_restarted_initial(&self, state: ChapterState) -> bool {
        self.enqueue(LoadRequest::RestartInitial(state))
    }

    /// Requests loading the chapter before the first loaded one.
    pub fn try_load_previous(&self) -> bool {
        self.enqueue(LoadRequest::Previous)
    }

    /// Requests loading the chapter after the last loaded one.
    pub fn try_load_next(&self) -> bool {
        self.enqueue(LoadRequest::Next)
    }

    fn enqueue(&self, request: LoadRequest) -> bool {
        let kind = request.kind();
        let mut state = self.shared.state.lock();

        if !state.pending.insert(kind) {
            debug!("Dropping duplicate {:?} load request", kind);
            return false;
        }
        if state.requests.send(request).is_err() {
            state.pending.remove(&kind);
            warn!("Loader is closed, dropping {:?} load request", kind);
            return false;
        }
        true
    }

    /// Discards every loaded item and pending request and starts over.
    pub fn reload(&self) {
        let (requests, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let generation = {
            let mut state = self.shared.state.lock();
            state.cancel.cancel();
            state.generation += 1;
            state.reader_state = ReaderState::InitialLoad;
            state.pending.clear();
            state.loaded.clear();
            state.stats.clear();
            state.requests = requests;
            state.cancel = cancel.clone();
            self.shared.items_tx.send_replace(Arc::new(Vec::new()));
            state.generation
        };

        info!("Reloading chapters (generation {})", generation);
        Worker::spawn(self.shared.clone(), generation, cancel, receiver);
    }

    /// Stops the consumer task; later requests are dropped.
    pub fn close(&self) {
        self.shared.state.lock().cancel.cancel();
    }

    /// Current item list.
    pub fn items(&self) -> ItemsSnapshot {
        self.shared.items_tx.borrow().clone()
    }

    /// Receives a new snapshot after every list mutation.
    pub fn subscribe_items(&self) -> watch::Receiver<ItemsSnapshot> {
        self.shared.items_tx.subscribe()
    }

    /// Receives loader events.
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.shared.events.subscribe()
    }

    pub fn reader_state(&self) -> ReaderState {
        self.shared.state.lock().reader_state
    }

    /// Chapters of the book, sorted by position.
    pub fn chapters(&self) -> &[Chapter] {
        &self.shared.chapters
    }

    pub fn chapter_index_of(&self, chapter_url: &str) -> Option<usize> {
        self.shared.chapters.iter().position(|c| c.url == chapter_url)
    }

    pub fn is_last_chapter(&self, chapter_index: usize) -> bool {
        chapter_index + 1 == self.shared.chapters.len()
    }

    pub fn is_chapter_index_valid(&self, chapter_index: usize) -> bool {
        chapter_index < self.shared.chapters.len()
    }

    /// Whether the chapter finished loading, successfully or not.
    pub fn is_chapter_index_loaded(&self, chapter_index: usize) -> bool {
        match self.shared.chapters.get(chapter_index) {
            Some(chapter) => self.shared.state.lock().loaded.contains(&chapter.url),
            None => false,
        }
    }

    pub fn chapter_stats(&self, chapter_url: &str) -> Option<ChapterStats> {
        self.shared.state.lock().stats.get(chapter_url).cloned()
    }

    /// Reading progress of the positioned item `(chapter_index, chapter_item_position)`.
    pub fn item_context(&self, chapter_index: usize, chapter_item_position: usize) -> Option<ReadingChapterPosStats> {
        let items = self.items();
        let index = index_of_reader_item(&items, chapter_index, chapter_item_position)?;
        self.context_of(&items[index])
    }

    /// Reading progress of the item at `list_index`.
    pub fn item_context_at(&self, list_index: usize) -> Option<ReadingChapterPosStats> {
        let items = self.items();
        self.context_of(items.get(list_index)?)
    }

    fn context_of(&self, item: &ReaderItem) -> Option<ReadingChapterPosStats> {
        let chapter_item_position = item.chapter_item_position()?;
        let stats = self.chapter_stats(&item.chapter_url)?;
        Some(ReadingChapterPosStats {
            chapter_index: item.chapter_index,
            chapter_count: self.shared.chapters.len(),
            chapter_item_position,
            chapter_items_count: stats.items_count,
            chapter_title: stats.chapter.title,
            chapter_url: stats.chapter.url,
        })
    }
}

impl Drop for ChapterLoader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Where inserted items go.
///
/// A head cursor tracks its index through inserts and removals made before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Head(usize),
    Tail,
}

impl Cursor {
    fn insert(&mut self, items: &mut Vec<ReaderItem>, item: ReaderItem) {
        match self {
            Cursor::Head(index) => {
                items.insert(*index, item);
                *index += 1;
            }
            Cursor::Tail => items.push(item),
        }
    }

    fn insert_all(&mut self, items: &mut Vec<ReaderItem>, new_items: Vec<ReaderItem>) {
        match self {
            Cursor::Head(index) => {
                let count = new_items.len();
                items.splice(*index..*index, new_items);
                *index += count;
            }
            Cursor::Tail => items.extend(new_items),
        }
    }

    fn remove<P>(&mut self, items: &mut Vec<ReaderItem>, predicate: P)
    where
        P: Fn(&ReaderItem) -> bool,
    {
        let mut position = 0;
        while position < items.len() {
            if predicate(&items[position]) {
                items.remove(position);
                if let Cursor::Head(index) = self {
                    if position < *index {
                        *index -= 1;
                    }
                }
            } else {
                position += 1;
            }
        }
    }
}

/// Resolves where an initial load should scroll to within a chapter.
///
/// The stored position is used when the chapter is the book's last read one
/// or has not been finished yet; finished chapters open at the title.
pub fn initial_chapter_position(book: Option<&Book>, chapter: &Chapter) -> (usize, i32) {
    let is_last_read = book.and_then(|b| b.last_read_chapter.as_deref()) == Some(chapter.url.as_str());

    if is_last_read || !chapter.read {
        (chapter.last_read_position, chapter.last_read_offset)
    } else {
        (0, 0)
    }
}

/// The single consumer of one loader generation.
struct Worker {
    shared: Arc<LoaderShared>,
    generation: u64,
    items: Vec<ReaderItem>,
}

impl Worker {
    fn spawn(
        shared: Arc<LoaderShared>,
        generation: u64,
        cancel: CancellationToken,
        receiver: mpsc::UnboundedReceiver<LoadRequest>,
    ) {
        let worker = Worker {
            shared,
            generation,
            items: Vec::new(),
        };
        tokio::spawn(worker.run(cancel, receiver));
    }

    async fn run(mut self, cancel: CancellationToken, mut receiver: mpsc::UnboundedReceiver<LoadRequest>) {
        debug!("Chapter loader generation {} started", self.generation);

        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = receiver.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let kind = request.kind();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LoaderError::Cancelled),
                outcome = self.handle(request) => outcome,
            };

            // Cleared before the final event so listeners can queue the next request
            self.finish_request(kind);

            match outcome {
                Ok(Some(event)) => {
                    let _ = self.emit(event);
                }
                Ok(None) => {}
                Err(LoaderError::Cancelled) => break,
                Err(e) => debug!("{:?} load request ended: {}", kind, e),
            }
        }

        debug!("Chapter loader generation {} stopped", self.generation);
    }

    async fn handle(&mut self, request: LoadRequest) -> Result<Option<LoaderEvent>, LoaderError> {
        match request {
            LoadRequest::Initial { chapter_index } => self.load_initial(chapter_index).await,
            LoadRequest::RestartInitial(state) => self.load_restarted_initial(state).await,
            LoadRequest::Previous => self.load_previous().await,
            LoadRequest::Next => self.load_next().await,
        }
    }

    async fn load_initial(&mut self, chapter_index: usize) -> Result<Option<LoaderEvent>, LoaderError> {
        self.set_reader_state(ReaderState::InitialLoad)?;

        if chapter_index >= self.shared.chapters.len() {
            warn!("Invalid chapter index {}", chapter_index);
            self.emit(LoaderEvent::InvalidChapter)?;
            return Ok(None);
        }

        self.maintain(None, Vec::clear)?;
        self.add_chapter(chapter_index, &mut Cursor::Tail, Some(AnchorMode::Start))
            .await?;

        let position = self.initial_position(chapter_index).await;
        self.emit(LoaderEvent::InitialPosition(position))?;

        Ok(Some(Self::loaded(chapter_index, ChapterLoadedKind::Initial)))
    }

    async fn load_restarted_initial(&mut self, state: ChapterState) -> Result<Option<LoaderEvent>, LoaderError> {
        self.set_reader_state(ReaderState::InitialLoad)?;

        let Some(chapter_index) = self.shared.chapters.iter().position(|c| c.url == state.chapter_url) else {
            warn!("Unknown chapter {}", state.chapter_url);
            self.emit(LoaderEvent::InvalidChapter)?;
            return Ok(None);
        };

        self.maintain(None, Vec::clear)?;
        self.add_chapter(chapter_index, &mut Cursor::Tail, Some(AnchorMode::Start))
            .await?;

        self.emit(LoaderEvent::InitialPosition(ItemPosition {
            chapter_index,
            chapter_item_index: state.chapter_item_position,
            item_offset: state.offset,
        }))?;

        Ok(Some(Self::loaded(chapter_index, ChapterLoadedKind::Initial)))
    }

    async fn load_previous(&mut self) -> Result<Option<LoaderEvent>, LoaderError> {
        self.set_reader_state(ReaderState::Loading)?;

        let Some(first) = self.items.first() else {
            debug!("No chapter loaded, ignoring previous chapter request");
            return Ok(None);
        };
        if matches!(first.kind, ItemKind::BookStart) {
            return Ok(None);
        }

        let chapter_index = first.chapter_index;
        if chapter_index == 0 {
            let chapter_url = self.shared.chapters[0].url.clone();
            self.maintain(Some(AnchorMode::LastVisible), |items| {
                items.insert(0, ReaderItem::book_start(&chapter_url, 0));
            })?;
            return Ok(None);
        }

        let previous = chapter_index - 1;
        self.add_chapter(previous, &mut Cursor::Head(0), Some(AnchorMode::LastVisible))
            .await?;
        Ok(Some(Self::loaded(previous, ChapterLoadedKind::Previous)))
    }

    async fn load_next(&mut self) -> Result<Option<LoaderEvent>, LoaderError> {
        self.set_reader_state(ReaderState::Loading)?;

        let Some(last) = self.items.last() else {
            debug!("No chapter loaded, ignoring next chapter request");
            return Ok(None);
        };
        if matches!(last.kind, ItemKind::BookEnd) {
            return Ok(None);
        }

        let chapter_index = last.chapter_index;
        let last_index = self.shared.chapters.len().saturating_sub(1);
        if chapter_index >= last_index {
            let chapter_url = self.shared.chapters[last_index].url.clone();
            self.maintain(None, |items| {
                items.push(ReaderItem::book_end(&chapter_url, last_index));
            })?;
            return Ok(None);
        }

        let next = chapter_index + 1;
        self.add_chapter(next, &mut Cursor::Tail, None).await?;
        Ok(Some(Self::loaded(next, ChapterLoadedKind::Next)))
    }

    /// Loads one chapter into the list at `cursor`.
    ///
    /// A failed fetch leaves an error item in place of the chapter body; the
    /// chapter still counts as loaded.
    async fn add_chapter(
        &mut self,
        chapter_index: usize,
        cursor: &mut Cursor,
        anchor: Option<AnchorMode>,
    ) -> Result<(), LoaderError> {
        let chapter = self
            .shared
            .chapters
            .get(chapter_index)
            .cloned()
            .ok_or(LoaderError::InvalidChapter(chapter_index))?;
        let url = chapter.url.clone();
        let translator = self.shared.translator.clone();

        let title_translated = translate_if_active(translator.as_ref(), &chapter.title).await;
        self.maintain(anchor, |items| {
            cursor.insert(items, ReaderItem::divider(&url, chapter_index));
            cursor.insert(items, ReaderItem::title(&url, chapter_index, &chapter.title, title_translated));
            cursor.insert(items, ReaderItem::progressbar(&url, chapter_index));
        })?;

        let text = match self.shared.repository.fetch_chapter_body(&url).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to load chapter {}: {}", url, e);
                self.record_stats(&chapter, chapter_index, 1)?;
                let message = e.to_string();
                self.maintain(anchor, |items| {
                    cursor.remove(items, |item| {
                        item.chapter_index == chapter_index && matches!(item.kind, ItemKind::Progressbar)
                    });
                    cursor.insert(items, ReaderItem::error(&url, chapter_index, &message));
                })?;
                return self.mark_loaded(&url);
            }
        };

        let mut body = text_to_items(&url, chapter_index, &text);
        let translating = translator.is_active();

        if translating {
            let source = translator.source_language().unwrap_or_default();
            let target = translator.target_language().unwrap_or_default();
            self.maintain(anchor, |items| {
                cursor.insert(items, ReaderItem::translating(&url, chapter_index, &source, &target));
            })?;
            body = self.translate_items(body).await;
        }

        debug!("Chapter {} split into {} items", url, body.len());
        self.record_stats(&chapter, chapter_index, body.len())?;

        self.maintain(anchor, |items| {
            cursor.remove(items, |item| {
                item.chapter_index == chapter_index
                    && matches!(item.kind, ItemKind::Progressbar | ItemKind::Translating { .. })
            });
            if translating {
                cursor.insert(items, ReaderItem::translation_attribution(&url, chapter_index));
            }
            cursor.insert_all(items, body);
            cursor.insert(items, ReaderItem::divider(&url, chapter_index));
        })?;
        self.mark_loaded(&url)
    }

    /// Translates body paragraphs concurrently, keeping their order.
    async fn translate_items(&self, items: Vec<ReaderItem>) -> Vec<ReaderItem> {
        let translator = self.shared.translator.clone();

        stream::iter(items)
            .map(|item| {
                let translator = translator.clone();
                async move {
                    let text = match &item.kind {
                        ItemKind::Body { text, .. } => text.clone(),
                        _ => return item,
                    };
                    let translation = translate_if_active(translator.as_ref(), &text).await;
                    item.with_translation(translation)
                }
            })
            .buffered(self.shared.translation_concurrency)
            .collect::<Vec<_>>()
            .await
    }

    async fn initial_position(&self, chapter_index: usize) -> ItemPosition {
        let chapter = &self.shared.chapters[chapter_index];
        let repository = &self.shared.repository;

        let book = match repository.get_book(&self.shared.book_url).await {
            Ok(book) => book,
            Err(e) => {
                warn!("Failed to load book {}: {}", self.shared.book_url, e);
                None
            }
        };
        let current = match repository.get_chapter(&chapter.url).await {
            Ok(Some(current)) => current,
            Ok(None) => chapter.clone(),
            Err(e) => {
                warn!("Failed to load chapter {}: {}", chapter.url, e);
                chapter.clone()
            }
        };

        let (position, offset) = initial_chapter_position(book.as_ref(), &current);
        let (chapter_item_index, item_offset) = match index_of_reader_item(&self.items, chapter_index, position) {
            Some(_) => (position, offset),
            None => (0, 0),
        };

        ItemPosition {
            chapter_index,
            chapter_item_index,
            item_offset,
        }
    }

    fn loaded(chapter_index: usize, kind: ChapterLoadedKind) -> LoaderEvent {
        LoaderEvent::ChapterLoaded(ChapterLoaded { chapter_index, kind })
    }

    /// Mutates the list between anchor capture and restore, then publishes it.
    fn maintain<F>(&mut self, anchor: Option<AnchorMode>, mutate: F) -> Result<(), LoaderError>
    where
        F: FnOnce(&mut Vec<ReaderItem>),
    {
        if let Some(mode) = anchor {
            self.shared.anchor.capture(mode);
        }
        mutate(&mut self.items);
        let published = self.publish();
        if let Some(mode) = anchor {
            self.shared.anchor.restore(mode);
        }
        published
    }

    fn publish(&self) -> Result<(), LoaderError> {
        let state = self.shared.state.lock();
        if state.generation != self.generation {
            return Err(LoaderError::Cancelled);
        }
        self.shared.items_tx.send_replace(Arc::new(self.items.clone()));
        Ok(())
    }

    fn emit(&self, event: LoaderEvent) -> Result<(), LoaderError> {
        let state = self.shared.state.lock();
        if state.generation != self.generation {
            return Err(LoaderError::Cancelled);
        }
        // No subscribers is fine
        let _ = self.shared.events.send(event);
        Ok(())
    }

    fn set_reader_state(&self, reader_state: ReaderState) -> Result<(), LoaderError> {
        let mut state = self.shared.state.lock();
        if state.generation != self.generation {
            return Err(LoaderError::Cancelled);
        }
        state.reader_state = reader_state;
        Ok(())
    }

    fn record_stats(&self, chapter: &Chapter, chapter_index: usize, items_count: usize) -> Result<(), LoaderError> {
        let mut state = self.shared.state.lock();
        if state.generation != self.generation {
            return Err(LoaderError::Cancelled);
        }
        state.stats.insert(
            chapter.url.clone(),
            ChapterStats {
                chapter: chapter.clone(),
                items_count,
                ordered_chapters_index: chapter_index,
            },
        );
        Ok(())
    }

    /// Only called once the chapter content is in the published list.
    fn mark_loaded(&self, chapter_url: &str) -> Result<(), LoaderError> {
        let mut state = self.shared.state.lock();
        if state.generation != self.generation {
            return Err(LoaderError::Cancelled);
        }
        state.loaded.insert(chapter_url.to_string());
        Ok(())
    }

    fn finish_request(&self, kind: LoadRequestKind) {
        let mut state = self.shared.state.lock();
        if state.generation != self.generation {
            return;
        }
        state.pending.remove(&kind);
        state.reader_state = ReaderState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Location;
    use crate::testing::{BOOK_URL, FakeRepository, FakeTranslator, chapters, wait_until};
    use crate::translation::NoTranslation;
    use std::time::Duration;
    use tokio::time::timeout;

    fn loader(repository: Arc<FakeRepository>, count: usize) -> ChapterLoader {
        ChapterLoader::new(
            BOOK_URL,
            chapters(count),
            repository,
            Arc::new(NoTranslation),
            LoaderOptions::default(),
        )
    }

    async fn next_event<F>(events: &mut broadcast::Receiver<LoaderEvent>, matches: F) -> LoaderEvent
    where
        F: Fn(&LoaderEvent) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("Timed out waiting for loader event")
    }

    async fn wait_loaded(events: &mut broadcast::Receiver<LoaderEvent>, chapter_index: usize, kind: ChapterLoadedKind) {
        let expected = LoaderEvent::ChapterLoaded(ChapterLoaded { chapter_index, kind });
        next_event(events, |event| *event == expected).await;
    }

    /// Chapter indices never decrease and positions increase within a chapter.
    fn assert_ordered(items: &[ReaderItem]) {
        for pair in items.windows(2) {
            assert!(pair[0].chapter_index <= pair[1].chapter_index, "Chapters out of order");
        }
        let positioned: Vec<(usize, usize)> = items
            .iter()
            .filter_map(|item| item.chapter_item_position().map(|p| (item.chapter_index, p)))
            .collect();
        for pair in positioned.windows(2) {
            if pair[0].0 == pair[1].0 {
                assert!(pair[0].1 < pair[1].1, "Positions out of order");
            }
        }
    }

    #[test]
    fn test_cursor_head_tracks_index() {
        let mut items = vec![ReaderItem::divider("c1", 1)];
        let mut cursor = Cursor::Head(0);

        cursor.insert(&mut items, ReaderItem::divider("c0", 0));
        cursor.insert(&mut items, ReaderItem::progressbar("c0", 0));
        assert_eq!(cursor, Cursor::Head(2));

        cursor.remove(&mut items, |item| matches!(item.kind, ItemKind::Progressbar));
        assert_eq!(cursor, Cursor::Head(1));

        cursor.insert_all(
            &mut items,
            vec![
                ReaderItem::body("c0", 0, 1, "a", Location::First),
                ReaderItem::body("c0", 0, 2, "b", Location::Last),
            ],
        );
        assert_eq!(cursor, Cursor::Head(3));
        assert_eq!(items.len(), 4);
        assert_eq!(items[3].chapter_index, 1);
    }

    #[test]
    fn test_initial_chapter_position() {
        let mut chapter = Chapter::new("c1", BOOK_URL, "One", 1);
        chapter.last_read_position = 4;
        chapter.last_read_offset = 12;

        let mut book = Book {
            url: BOOK_URL.to_string(),
            title: "Book".to_string(),
            last_read_chapter: None,
        };

        // Unread chapter resumes where it was left
        assert_eq!(initial_chapter_position(Some(&book), &chapter), (4, 12));

        chapter.read = true;
        assert_eq!(initial_chapter_position(Some(&book), &chapter), (0, 0));

        book.last_read_chapter = Some("c1".to_string());
        assert_eq!(initial_chapter_position(Some(&book), &chapter), (4, 12));
        assert_eq!(initial_chapter_position(None, &chapter), (0, 0));
    }

    #[tokio::test]
    async fn test_initial_load() {
        let repository = Arc::new(FakeRepository::new(&chapters(3), 3));
        let loader = loader(repository.clone(), 3);
        let mut events = loader.subscribe();

        assert!(loader.try_load_initial(1));
        let position = next_event(&mut events, |e| matches!(e, LoaderEvent::InitialPosition(_))).await;
        assert_eq!(
            position,
            LoaderEvent::InitialPosition(ItemPosition {
                chapter_index: 1,
                chapter_item_index: 0,
                item_offset: 0,
            })
        );
        wait_loaded(&mut events, 1, ChapterLoadedKind::Initial).await;

        let items = loader.items();
        assert_eq!(items.len(), 6);
        assert!(matches!(items[0].kind, ItemKind::Divider));
        assert_eq!(items[1].text_to_display(), Some("Chapter 1"));
        assert_eq!(items[2].text_to_display(), Some("Paragraph 1."));
        assert_eq!(items[4].location(), Some(Location::Last));
        assert!(matches!(items[5].kind, ItemKind::Divider));
        assert!(items.iter().all(|item| item.chapter_index == 1));

        assert!(loader.is_chapter_index_loaded(1));
        assert!(!loader.is_chapter_index_loaded(0));
        assert_eq!(loader.chapter_stats("c1").map(|s| s.items_count), Some(3));
        assert_eq!(loader.reader_state(), ReaderState::Idle);
        assert_eq!(repository.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_previous_and_next_keep_order() {
        let repository = Arc::new(FakeRepository::new(&chapters(4), 2));
        let loader = loader(repository.clone(), 4);
        let mut events = loader.subscribe();

        loader.try_load_initial(1);
        wait_loaded(&mut events, 1, ChapterLoadedKind::Initial).await;

        loader.try_load_next();
        wait_loaded(&mut events, 2, ChapterLoadedKind::Next).await;
        loader.try_load_previous();
        wait_loaded(&mut events, 0, ChapterLoadedKind::Previous).await;

        let items = loader.items();
        assert_ordered(&items);
        assert_eq!(items.first().map(|i| i.chapter_index), Some(0));
        assert_eq!(items.last().map(|i| i.chapter_index), Some(2));
        assert_eq!(repository.fetch_count(), 3);
        for chapter_index in 0..3 {
            assert!(loader.is_chapter_index_loaded(chapter_index));
        }
        assert!(!loader.is_chapter_index_loaded(3));
    }

    #[tokio::test]
    async fn test_book_boundaries_without_fetch() {
        let repository = Arc::new(FakeRepository::new(&chapters(1), 2));
        let loader = loader(repository.clone(), 1);
        let mut events = loader.subscribe();

        loader.try_load_initial(0);
        wait_loaded(&mut events, 0, ChapterLoadedKind::Initial).await;

        loader.try_load_previous();
        wait_until(|| matches!(loader.items().first().map(|i| &i.kind), Some(ItemKind::BookStart))).await;
        loader.try_load_next();
        wait_until(|| matches!(loader.items().last().map(|i| &i.kind), Some(ItemKind::BookEnd))).await;

        // Boundaries are terminal
        let before = loader.items().len();
        loader.try_load_previous();
        loader.try_load_next();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let items = loader.items();
        assert_eq!(items.len(), before);
        assert_eq!(items.iter().filter(|i| matches!(i.kind, ItemKind::BookStart)).count(), 1);
        assert_eq!(items.iter().filter(|i| matches!(i.kind, ItemKind::BookEnd)).count(), 1);
        assert_ordered(&items);
        assert_eq!(repository.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_requests_dropped() {
        let (repository, gate) = FakeRepository::new(&chapters(3), 2).gated();
        let repository = Arc::new(repository);
        let loader = loader(repository.clone(), 3);
        let mut events = loader.subscribe();

        assert!(loader.try_load_initial(0));
        assert!(!loader.try_load_initial(2));
        gate.add_permits(1);
        wait_loaded(&mut events, 0, ChapterLoadedKind::Initial).await;

        assert!(loader.try_load_next());
        assert!(!loader.try_load_next());
        gate.add_permits(1);
        wait_loaded(&mut events, 1, ChapterLoadedKind::Next).await;

        assert_eq!(repository.fetch_count(), 2);
        assert!(!loader.is_chapter_index_loaded(2));
        let titles = loader.items().iter().filter(|i| matches!(i.kind, ItemKind::Title { .. })).count();
        assert_eq!(titles, 2);

        // Accepted again once the previous one completed
        assert!(loader.try_load_next());
    }

    #[tokio::test]
    async fn test_invalid_chapter() {
        let repository = Arc::new(FakeRepository::new(&chapters(2), 2));
        let loader = loader(repository.clone(), 2);
        let mut events = loader.subscribe();

        loader.try_load_initial(0);
        wait_loaded(&mut events, 0, ChapterLoadedKind::Initial).await;
        let before = loader.items();

        loader.try_load_initial(7);
        next_event(&mut events, |e| *e == LoaderEvent::InvalidChapter).await;
        wait_until(|| loader.reader_state() == ReaderState::Idle).await;
        assert_eq!(loader.items(), before);

        loader.try_load_restarted_initial(ChapterState {
            chapter_url: "missing".to_string(),
            chapter_item_position: 0,
            offset: 0,
        });
        next_event(&mut events, |e| *e == LoaderEvent::InvalidChapter).await;
        assert_eq!(loader.items(), before);
        assert_eq!(repository.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_initial_uses_stored_state() {
        let repository = Arc::new(FakeRepository::new(&chapters(3), 4));
        let loader = loader(repository, 3);
        let mut events = loader.subscribe();

        loader.try_load_restarted_initial(ChapterState {
            chapter_url: "c2".to_string(),
            chapter_item_position: 3,
            offset: -20,
        });
        let position = next_event(&mut events, |e| matches!(e, LoaderEvent::InitialPosition(_))).await;
        assert_eq!(
            position,
            LoaderEvent::InitialPosition(ItemPosition {
                chapter_index: 2,
                chapter_item_index: 3,
                item_offset: -20,
            })
        );
        wait_loaded(&mut events, 2, ChapterLoadedKind::Initial).await;
        assert!(loader.is_chapter_index_loaded(2));
    }

    #[tokio::test]
    async fn test_initial_position_from_last_read_chapter() {
        let mut list = chapters(3);
        list[1].read = true;
        list[1].last_read_position = 2;
        list[1].last_read_offset = 7;
        list[2].last_read_position = 50;

        let repository = Arc::new(FakeRepository::new(&list, 3).with_last_read_chapter("c1"));
        let loader = ChapterLoader::new(
            BOOK_URL,
            list,
            repository,
            Arc::new(NoTranslation),
            LoaderOptions::default(),
        );
        let mut events = loader.subscribe();

        loader.try_load_initial(1);
        let position = next_event(&mut events, |e| matches!(e, LoaderEvent::InitialPosition(_))).await;
        assert_eq!(
            position,
            LoaderEvent::InitialPosition(ItemPosition {
                chapter_index: 1,
                chapter_item_index: 2,
                item_offset: 7,
            })
        );
        wait_loaded(&mut events, 1, ChapterLoadedKind::Initial).await;

        // Stored position past the end of the chapter falls back to the title
        loader.try_load_initial(2);
        let position = next_event(&mut events, |e| matches!(e, LoaderEvent::InitialPosition(_))).await;
        assert_eq!(
            position,
            LoaderEvent::InitialPosition(ItemPosition {
                chapter_index: 2,
                chapter_item_index: 0,
                item_offset: 0,
            })
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_becomes_error_item() {
        let repository = Arc::new(FakeRepository::new(&chapters(3), 2).with_failure("c1", "connection reset"));
        let loader = loader(repository, 3);
        let mut events = loader.subscribe();

        loader.try_load_initial(1);
        wait_loaded(&mut events, 1, ChapterLoadedKind::Initial).await;

        let items = loader.items();
        assert_eq!(items.len(), 3);
        assert!(matches!(items[1].kind, ItemKind::Title { .. }));
        match &items[2].kind {
            ItemKind::Error { message } => assert!(message.contains("connection reset")),
            other => panic!("Expected error item, got {:?}", other),
        }
        assert!(loader.is_chapter_index_loaded(1));
        assert_eq!(loader.chapter_stats("c1").map(|s| s.items_count), Some(1));

        // Loading continues past a failed chapter
        loader.try_load_previous();
        wait_loaded(&mut events, 0, ChapterLoadedKind::Previous).await;
        assert_ordered(&loader.items());
        assert!(!loader.items().iter().any(|i| matches!(i.kind, ItemKind::Progressbar)));
    }

    #[tokio::test]
    async fn test_live_translation() {
        let repository = Arc::new(FakeRepository::new(&chapters(2), 3));
        let translator = FakeTranslator::active().failing_on("Paragraph 2.");
        let loader = ChapterLoader::new(
            BOOK_URL,
            chapters(2),
            repository,
            Arc::new(translator),
            LoaderOptions {
                translation_concurrency: 2,
                ..LoaderOptions::default()
            },
        );
        let mut events = loader.subscribe();

        loader.try_load_initial(0);
        wait_loaded(&mut events, 0, ChapterLoadedKind::Initial).await;

        let items = loader.items();
        assert_eq!(items[1].text_to_display(), Some("[en] Chapter 0"));
        assert!(matches!(items[2].kind, ItemKind::TranslationAttribution));
        assert_eq!(items[3].text_to_display(), Some("[en] Paragraph 1."));
        // Failed translation falls back to the original text
        assert_eq!(items[4].text_to_display(), Some("Paragraph 2."));
        assert_eq!(items[5].text_to_display(), Some("[en] Paragraph 3."));
        assert!(matches!(items[6].kind, ItemKind::Divider));
        assert!(!items.iter().any(|i| matches!(i.kind, ItemKind::Translating { .. } | ItemKind::Progressbar)));
        assert_eq!(loader.chapter_stats("c0").map(|s| s.items_count), Some(3));
    }

    #[tokio::test]
    async fn test_reload_discards_stale_generation() {
        let (repository, gate) = FakeRepository::new(&chapters(3), 2).gated();
        let repository = Arc::new(repository);
        let loader = loader(repository.clone(), 3);
        let mut events = loader.subscribe();

        loader.try_load_initial(0);
        gate.add_permits(1);
        wait_loaded(&mut events, 0, ChapterLoadedKind::Initial).await;

        // Blocks inside the fetch
        assert!(loader.try_load_next());
        wait_until(|| repository.fetch_count() == 2).await;

        loader.reload();
        assert!(loader.items().is_empty());
        assert_eq!(loader.reader_state(), ReaderState::InitialLoad);
        assert!(!loader.is_chapter_index_loaded(0));
        assert!(loader.chapter_stats("c0").is_none());

        gate.add_permits(10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(loader.items().is_empty());

        assert!(loader.try_load_initial(2));
        wait_loaded(&mut events, 2, ChapterLoadedKind::Initial).await;
        let items = loader.items();
        assert!(items.iter().all(|i| i.chapter_index == 2));
        assert!(!loader.is_chapter_index_loaded(1));
    }

    #[tokio::test]
    async fn test_empty_list_ignores_previous_and_next() {
        let repository = Arc::new(FakeRepository::new(&chapters(2), 2));
        let loader = loader(repository.clone(), 2);

        assert!(loader.try_load_next());
        assert!(loader.try_load_previous());
        wait_until(|| loader.reader_state() == ReaderState::Idle).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(loader.items().is_empty());
        assert_eq!(repository.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_item_context() {
        let repository = Arc::new(FakeRepository::new(&chapters(3), 4));
        let loader = loader(repository, 3);
        let mut events = loader.subscribe();

        loader.try_load_initial(1);
        wait_loaded(&mut events, 1, ChapterLoadedKind::Initial).await;

        let context = loader.item_context(1, 2).unwrap();
        assert_eq!(context.chapter_count, 3);
        assert_eq!(context.chapter_items_count, 4);
        assert_eq!(context.chapter_title, "Chapter 1");
        assert_eq!(context.chapter_read_percentage(), 50.0);

        assert_eq!(loader.item_context_at(1).map(|c| c.chapter_item_position), Some(0));
        assert!(loader.item_context_at(0).is_none());
        assert!(loader.item_context(0, 1).is_none());
    }

    #[derive(Default)]
    struct RecordingAnchor {
        calls: Mutex<Vec<(&'static str, AnchorMode)>>,
    }

    impl ScrollAnchor for RecordingAnchor {
        fn capture(&self, mode: AnchorMode) {
            self.calls.lock().push(("capture", mode));
        }

        fn restore(&self, mode: AnchorMode) {
            self.calls.lock().push(("restore", mode));
        }
    }

    #[tokio::test]
    async fn test_anchor_modes() {
        let repository = Arc::new(FakeRepository::new(&chapters(3), 2));
        let anchor = Arc::new(RecordingAnchor::default());
        let loader = ChapterLoader::new(
            BOOK_URL,
            chapters(3),
            repository,
            Arc::new(NoTranslation),
            LoaderOptions {
                anchor: anchor.clone(),
                ..LoaderOptions::default()
            },
        );
        let mut events = loader.subscribe();

        loader.try_load_initial(1);
        wait_loaded(&mut events, 1, ChapterLoadedKind::Initial).await;
        let calls = std::mem::take(&mut *anchor.calls.lock());
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|(_, mode)| *mode == AnchorMode::Start));
        assert_eq!(calls[0].0, "capture");

        loader.try_load_previous();
        wait_loaded(&mut events, 0, ChapterLoadedKind::Previous).await;
        let calls = std::mem::take(&mut *anchor.calls.lock());
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|(_, mode)| *mode == AnchorMode::LastVisible));

        // Appending below the viewport needs no anchor
        loader.try_load_next();
        wait_loaded(&mut events, 2, ChapterLoadedKind::Next).await;
        assert!(anchor.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_translating_placeholder_while_pending() {
        let repository = Arc::new(FakeRepository::new(&chapters(1), 2));
        let (translator, gate) = FakeTranslator::active().gated();
        let loader = ChapterLoader::new(
            BOOK_URL,
            chapters(1),
            repository,
            Arc::new(translator),
            LoaderOptions::default(),
        );
        let mut events = loader.subscribe();

        // Lets the title through, paragraphs stay pending
        gate.add_permits(1);
        loader.try_load_initial(0);
        wait_until(|| {
            loader
                .items()
                .iter()
                .any(|i| matches!(i.kind, ItemKind::Translating { .. }))
        })
        .await;

        let items = loader.items();
        match &items[3].kind {
            ItemKind::Translating {
                source_language,
                target_language,
            } => {
                assert_eq!(source_language, "Japanese");
                assert_eq!(target_language, "English");
            }
            other => panic!("Expected translating placeholder, got {:?}", other),
        }
        assert!(!items.iter().any(|i| matches!(i.kind, ItemKind::Body { .. })));
        assert!(!loader.is_chapter_index_loaded(0));

        gate.add_permits(2);
        wait_loaded(&mut events, 0, ChapterLoadedKind::Initial).await;
        let items = loader.items();
        assert!(!items.iter().any(|i| matches!(i.kind, ItemKind::Translating { .. })));
        assert_eq!(items[3].text_to_display(), Some("[en] Paragraph 1."));
    }

    /// Records at every anchor call whether chapter 0 counts as loaded and
    /// whether its content is already in the list.
    #[derive(Default)]
    struct LoadedStateAnchor {
        loader: Mutex<std::sync::Weak<ChapterLoader>>,
        seen: Mutex<Vec<(bool, bool)>>,
    }

    impl LoadedStateAnchor {
        fn record(&self) {
            let Some(loader) = self.loader.lock().upgrade() else {
                return;
            };
            let has_content = loader
                .items()
                .iter()
                .any(|i| i.chapter_index == 0 && matches!(i.kind, ItemKind::Body { .. } | ItemKind::Error { .. }));
            self.seen.lock().push((loader.is_chapter_index_loaded(0), has_content));
        }
    }

    impl ScrollAnchor for LoadedStateAnchor {
        fn capture(&self, _mode: AnchorMode) {
            self.record();
        }

        fn restore(&self, _mode: AnchorMode) {
            self.record();
        }
    }

    async fn assert_loaded_only_with_content(repository: FakeRepository) {
        let anchor = Arc::new(LoadedStateAnchor::default());
        let loader = Arc::new(ChapterLoader::new(
            BOOK_URL,
            chapters(2),
            Arc::new(repository),
            Arc::new(NoTranslation),
            LoaderOptions {
                anchor: anchor.clone(),
                ..LoaderOptions::default()
            },
        ));
        *anchor.loader.lock() = Arc::downgrade(&loader);
        let mut events = loader.subscribe();

        loader.try_load_initial(1);
        wait_loaded(&mut events, 1, ChapterLoadedKind::Initial).await;
        anchor.seen.lock().clear();

        loader.try_load_previous();
        wait_loaded(&mut events, 0, ChapterLoadedKind::Previous).await;

        let seen = anchor.seen.lock().clone();
        assert!(!seen.is_empty());
        assert!(
            seen.iter().all(|&(loaded, has_content)| !loaded || has_content),
            "Chapter reported loaded before its content: {:?}",
            seen
        );
        assert!(loader.is_chapter_index_loaded(0));
    }

    #[tokio::test]
    async fn test_chapter_loaded_only_after_body_published() {
        assert_loaded_only_with_content(FakeRepository::new(&chapters(2), 2)).await;
    }

    #[tokio::test]
    async fn test_failed_chapter_loaded_only_after_error_published() {
        assert_loaded_only_with_content(FakeRepository::new(&chapters(2), 2).with_failure("c0", "timed out")).await;
    }
}
