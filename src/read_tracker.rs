//! Marks chapters as read once both their first and last paragraph were seen.

use crate::repository::ContentRepository;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which boundaries of a chapter have been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ChapterReadStatus {
    start_seen: bool,
    end_seen: bool,
}

impl ChapterReadStatus {
    fn is_read(self) -> bool {
        self.start_seen && self.end_seen
    }
}

/// Tracks chapter boundaries seen by the reader and persists the read flag.
///
/// Updates run on background tasks; callers may ignore the returned handles.
#[derive(Clone)]
pub struct ReadTracker {
    repository: Arc<dyn ContentRepository>,
    statuses: Arc<Mutex<HashMap<String, ChapterReadStatus>>>,
}

impl ReadTracker {
    pub fn new(repository: Arc<dyn ContentRepository>) -> Self {
        Self {
            repository,
            statuses: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Records that the first paragraph of a chapter became visible.
    pub fn set_read_start(&self, chapter_url: &str) -> JoinHandle<()> {
        self.update(chapter_url, |status| ChapterReadStatus {
            start_seen: true,
            ..status
        })
    }

    /// Records that the last paragraph of a chapter became visible.
    pub fn set_read_end(&self, chapter_url: &str) -> JoinHandle<()> {
        self.update(chapter_url, |status| ChapterReadStatus {
            end_seen: true,
            ..status
        })
    }

    fn update<F>(&self, chapter_url: &str, apply: F) -> JoinHandle<()>
    where
        F: FnOnce(ChapterReadStatus) -> ChapterReadStatus + Send + 'static,
    {
        let repository = self.repository.clone();
        let statuses = self.statuses.clone();
        let chapter_url = chapter_url.to_string();

        tokio::spawn(async move {
            // Held for the whole update so concurrent start/end calls serialize
            let mut statuses = statuses.lock().await;

            let old_status = match statuses.get(&chapter_url) {
                Some(status) => *status,
                None => {
                    let chapter = match repository.get_chapter(&chapter_url).await {
                        Ok(Some(chapter)) => chapter,
                        Ok(None) => {
                            debug!(chapter_url = %chapter_url, "Ignoring unknown chapter");
                            return;
                        }
                        Err(e) => {
                            warn!(chapter_url = %chapter_url, error = %e, "Failed to load chapter");
                            return;
                        }
                    };
                    ChapterReadStatus {
                        start_seen: chapter.read,
                        end_seen: chapter.read,
                    }
                }
            };

            if old_status.is_read() {
                statuses.insert(chapter_url, old_status);
                return;
            }

            let new_status = apply(old_status);
            if new_status.is_read() {
                debug!(chapter_url = %chapter_url, "Chapter read");
                if let Err(e) = repository.set_as_read(&chapter_url, true).await {
                    warn!(chapter_url = %chapter_url, error = %e, "Failed to mark chapter as read");
                }
            }
            statuses.insert(chapter_url, new_status);
        })
    }
}
