//! Test doubles shared by the module tests.

use crate::chapter::{Book, Chapter};
use crate::error::ContentError;
use crate::repository::ContentRepository;
use crate::speech::{PlayState, SpeechEngine, Utterance, Voice};
use crate::translation::Translator;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};

pub const BOOK_URL: &str = "book";

/// Builds `count` chapters with urls `c0..cN`.
pub fn chapters(count: usize) -> Vec<Chapter> {
    (0..count)
        .map(|i| Chapter::new(format!("c{}", i), BOOK_URL, format!("Chapter {}", i), i as u32))
        .collect()
}

/// Chapter body with `paragraphs` paragraphs.
pub fn body(paragraphs: usize) -> String {
    (1..=paragraphs)
        .map(|i| format!("Paragraph {}.", i))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Polls `condition` until it holds, failing the test after a second.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Condition not reached in time");
}

/// In-memory repository recording every call.
pub struct FakeRepository {
    chapters: Mutex<Vec<Chapter>>,
    bodies: HashMap<String, Result<String, String>>,
    book: Mutex<Book>,
    gate: Option<Arc<Semaphore>>,
    pub fetches: AtomicUsize,
    pub read_writes: Mutex<Vec<(String, bool)>>,
    pub position_writes: Mutex<Vec<(String, usize, i32)>>,
}

impl FakeRepository {
    /// Every chapter gets a body with `paragraphs` paragraphs.
    pub fn new(chapters: &[Chapter], paragraphs: usize) -> Self {
        let bodies = chapters.iter().map(|c| (c.url.clone(), Ok(body(paragraphs)))).collect();
        Self {
            chapters: Mutex::new(chapters.to_vec()),
            bodies,
            book: Mutex::new(Book {
                url: BOOK_URL.to_string(),
                title: "Book".to_string(),
                last_read_chapter: None,
            }),
            gate: None,
            fetches: AtomicUsize::new(0),
            read_writes: Mutex::new(Vec::new()),
            position_writes: Mutex::new(Vec::new()),
        }
    }

    /// Makes fetching `chapter_url` fail with `message`.
    pub fn with_failure(mut self, chapter_url: &str, message: &str) -> Self {
        self.bodies.insert(chapter_url.to_string(), Err(message.to_string()));
        self
    }

    /// Holds every fetch until a permit is released on the returned gate.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn with_last_read_chapter(self, chapter_url: &str) -> Self {
        self.book.lock().last_read_chapter = Some(chapter_url.to_string());
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn read_write_count(&self) -> usize {
        self.read_writes.lock().len()
    }
}

#[async_trait]
impl ContentRepository for FakeRepository {
    async fn fetch_chapter_body(&self, chapter_url: &str) -> Result<String, ContentError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        match self.bodies.get(chapter_url) {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(message)) => Err(ContentError::NotFound(message.clone())),
            None => Err(ContentError::NotFound(chapter_url.to_string())),
        }
    }

    async fn get_chapter(&self, chapter_url: &str) -> Result<Option<Chapter>, ContentError> {
        Ok(self.chapters.lock().iter().find(|c| c.url == chapter_url).cloned())
    }

    async fn chapters(&self, _book_url: &str) -> Result<Vec<Chapter>, ContentError> {
        Ok(self.chapters.lock().clone())
    }

    async fn set_as_read(&self, chapter_url: &str, read: bool) -> Result<(), ContentError> {
        self.read_writes.lock().push((chapter_url.to_string(), read));
        if let Some(chapter) = self.chapters.lock().iter_mut().find(|c| c.url == chapter_url) {
            chapter.read = read;
        }
        Ok(())
    }

    async fn update_chapter_position(&self, chapter_url: &str, position: usize, offset: i32) -> Result<(), ContentError> {
        self.position_writes.lock().push((chapter_url.to_string(), position, offset));
        Ok(())
    }

    async fn get_book(&self, _book_url: &str) -> Result<Option<Book>, ContentError> {
        Ok(Some(self.book.lock().clone()))
    }

    async fn update_last_read_chapter(&self, _book_url: &str, chapter_url: &str) -> Result<(), ContentError> {
        self.book.lock().last_read_chapter = Some(chapter_url.to_string());
        Ok(())
    }
}

/// Translator that prefixes text with the target language.
pub struct FakeTranslator {
    pub active: bool,
    pub fail_on: Option<String>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeTranslator {
    pub fn active() -> Self {
        Self {
            active: true,
            fail_on: None,
            gate: None,
        }
    }

    /// Makes translating `text` fail.
    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on = Some(text.to_string());
        self
    }

    /// Holds every translation until a permit is released on the returned gate.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }
}

#[async_trait]
impl Translator for FakeTranslator {
    async fn translate(&self, text: &str) -> Option<String> {
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.fail_on.as_deref() == Some(text) {
            return None;
        }
        Some(format!("[en] {}", text))
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn source_language(&self) -> Option<String> {
        Some("Japanese".to_string())
    }

    fn target_language(&self) -> Option<String> {
        Some("English".to_string())
    }
}

/// Speech engine whose queue is drained by the test.
pub struct FakeSpeech {
    queue: Mutex<VecDeque<Utterance>>,
    current: Mutex<Option<Utterance>>,
    voice: Mutex<Option<String>>,
    events: broadcast::Sender<Utterance>,
    pub spoken: Mutex<Vec<(String, Utterance)>>,
    pub stops: AtomicUsize,
    queue_delay: Option<Duration>,
}

impl Default for FakeSpeech {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            queue: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            voice: Mutex::new(None),
            events,
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            queue_delay: None,
        }
    }
}

impl FakeSpeech {
    /// Blocks the caller of `queued` for `delay` after reading the queue.
    pub fn with_queue_delay(delay: Duration) -> Self {
        Self {
            queue_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Starts the oldest queued utterance.
    pub fn play_next(&self) -> Option<Utterance> {
        let utterance = self.queue.lock().front().copied()?.with_state(PlayState::Playing);
        *self.current.lock() = Some(utterance);
        let _ = self.events.send(utterance);
        Some(utterance)
    }

    /// Completes the oldest queued utterance.
    pub fn finish_next(&self) -> Option<Utterance> {
        let utterance = self.queue.lock().pop_front()?.with_state(PlayState::Finished);
        *self.current.lock() = Some(utterance);
        let _ = self.events.send(utterance);
        Some(utterance)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn spoken_count(&self) -> usize {
        self.spoken.lock().len()
    }

    pub fn selected_voice(&self) -> Option<String> {
        self.voice.lock().clone()
    }
}

impl SpeechEngine for FakeSpeech {
    fn speak(&self, text: &str, utterance: Utterance) {
        self.queue.lock().push_back(utterance);
        self.spoken.lock().push((text.to_string(), utterance));
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().clear();
    }

    fn queued(&self) -> Vec<Utterance> {
        let queued = self.queue.lock().iter().copied().collect();
        if let Some(delay) = self.queue_delay {
            std::thread::sleep(delay);
        }
        queued
    }

    fn subscribe(&self) -> broadcast::Receiver<Utterance> {
        self.events.subscribe()
    }

    fn current(&self) -> Option<Utterance> {
        *self.current.lock()
    }

    fn set_current(&self, utterance: Utterance) {
        *self.current.lock() = Some(utterance);
    }

    fn voices(&self) -> Vec<Voice> {
        vec![Voice {
            id: "narrator".to_string(),
            name: "Narrator".to_string(),
            language: "en".to_string(),
        }]
    }

    fn set_voice(&self, id: &str) -> bool {
        let known = self.voices().iter().any(|v| v.id == id);
        if known {
            *self.voice.lock() = Some(id.to_string());
        }
        known
    }
}
