//! Content repository contract and a file-backed local library.
//!
//! The loader only ever calls the [`ContentRepository`] trait; caching and
//! retry policy belong to the implementation. [`LocalLibrary`] serves a book
//! laid out on disk as:
//!
//! ```text
//! my-book/
//!   book.toml       title + ordered chapter list
//!   001.txt ...     chapter bodies, paragraphs separated by a blank line
//!   progress.json   reading progress, written by the library
//! ```

use crate::chapter::{Book, Chapter};
use crate::error::ContentError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Book metadata filename.
const BOOK_FILENAME: &str = "book.toml";

/// Reading progress filename.
const PROGRESS_FILENAME: &str = "progress.json";

/// URL scheme of books served from disk.
const LOCAL_SCHEME: &str = "local://";

/// Source of chapter content and reading progress.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Fetches the text body of a chapter.
    async fn fetch_chapter_body(&self, chapter_url: &str) -> Result<String, ContentError>;

    /// Returns the current record of a chapter.
    async fn get_chapter(&self, chapter_url: &str) -> Result<Option<Chapter>, ContentError>;

    /// Returns every chapter of a book, in no particular order.
    async fn chapters(&self, book_url: &str) -> Result<Vec<Chapter>, ContentError>;

    /// Sets the read flag of a chapter.
    async fn set_as_read(&self, chapter_url: &str, read: bool) -> Result<(), ContentError>;

    /// Stores the last read item position and offset of a chapter.
    async fn update_chapter_position(&self, chapter_url: &str, position: usize, offset: i32) -> Result<(), ContentError>;

    /// Returns the record of a book.
    async fn get_book(&self, book_url: &str) -> Result<Option<Book>, ContentError>;

    /// Stores the chapter the reader is currently on.
    async fn update_last_read_chapter(&self, book_url: &str, chapter_url: &str) -> Result<(), ContentError>;
}

/// One chapter entry in `book.toml`.
#[derive(Debug, Clone, Deserialize)]
struct ChapterEntry {
    title: String,
    file: PathBuf,
}

/// Contents of `book.toml`.
#[derive(Debug, Clone, Deserialize)]
struct BookManifest {
    title: String,
    chapters: Vec<ChapterEntry>,
}

/// Saved progress of a single chapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChapterProgress {
    read: bool,
    last_read_position: usize,
    last_read_offset: i32,
}

/// Contents of `progress.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProgressData {
    last_read_chapter: Option<String>,
    chapters: HashMap<String, ChapterProgress>,
}

/// Mutable library state.
struct LibraryState {
    book: Book,
    chapters: Vec<Chapter>,
}

/// A single book stored in a local directory.
pub struct LocalLibrary {
    root: PathBuf,
    files: HashMap<String, PathBuf>,
    state: Mutex<LibraryState>,
    bodies: Mutex<HashMap<String, String>>,
}

impl LocalLibrary {
    /// Opens the book stored in `root`.
    pub async fn open(root: &Path) -> Result<Self, ContentError> {
        let manifest_path = root.join(BOOK_FILENAME);
        if !manifest_path.exists() {
            return Err(ContentError::NotFound(manifest_path.display().to_string()));
        }

        let content = tokio::fs::read_to_string(&manifest_path).await?;
        let manifest: BookManifest = toml::from_str(&content).map_err(|e| ContentError::Parse(e.to_string()))?;

        let progress_path = root.join(PROGRESS_FILENAME);
        let progress: ProgressData = if progress_path.exists() {
            serde_json::from_str(&tokio::fs::read_to_string(&progress_path).await?)?
        } else {
            ProgressData::default()
        };

        let book_url = format!("{}{}", LOCAL_SCHEME, root.display());
        let mut files = HashMap::new();
        let mut chapters = Vec::with_capacity(manifest.chapters.len());

        for (position, entry) in manifest.chapters.iter().enumerate() {
            let url = format!("{}/{}", book_url, entry.file.display());
            let mut chapter = Chapter::new(url.clone(), book_url.clone(), entry.title.clone(), position as u32);
            if let Some(saved) = progress.chapters.get(&url) {
                chapter.read = saved.read;
                chapter.last_read_position = saved.last_read_position;
                chapter.last_read_offset = saved.last_read_offset;
            }
            files.insert(url, root.join(&entry.file));
            chapters.push(chapter);
        }

        let book = Book {
            url: book_url,
            title: manifest.title,
            last_read_chapter: progress.last_read_chapter,
        };

        Ok(Self {
            root: root.to_path_buf(),
            files,
            state: Mutex::new(LibraryState { book, chapters }),
            bodies: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the book served by this library.
    pub async fn book(&self) -> Book {
        self.state.lock().await.book.clone()
    }

    /// Updates one chapter and persists progress.
    async fn update_chapter<F>(&self, chapter_url: &str, update: F) -> Result<(), ContentError>
    where
        F: FnOnce(&mut Chapter) + Send,
    {
        let mut state = self.state.lock().await;
        let chapter = state
            .chapters
            .iter_mut()
            .find(|c| c.url == chapter_url)
            .ok_or_else(|| ContentError::NotFound(chapter_url.to_string()))?;
        update(chapter);
        self.save_progress(&state).await
    }

    /// Writes `progress.json` from the current state.
    async fn save_progress(&self, state: &LibraryState) -> Result<(), ContentError> {
        let data = ProgressData {
            last_read_chapter: state.book.last_read_chapter.clone(),
            chapters: state
                .chapters
                .iter()
                .map(|c| {
                    (
                        c.url.clone(),
                        ChapterProgress {
                            read: c.read,
                            last_read_position: c.last_read_position,
                            last_read_offset: c.last_read_offset,
                        },
                    )
                })
                .collect(),
        };

        let content = serde_json::to_string_pretty(&data)?;
        tokio::fs::write(self.root.join(PROGRESS_FILENAME), content).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentRepository for LocalLibrary {
    async fn fetch_chapter_body(&self, chapter_url: &str) -> Result<String, ContentError> {
        if let Some(body) = self.bodies.lock().await.get(chapter_url) {
            return Ok(body.clone());
        }

        let path = self
            .files
            .get(chapter_url)
            .ok_or_else(|| ContentError::NotFound(chapter_url.to_string()))?;
        let body = tokio::fs::read_to_string(path).await?;

        self.bodies.lock().await.insert(chapter_url.to_string(), body.clone());
        Ok(body)
    }

    async fn get_chapter(&self, chapter_url: &str) -> Result<Option<Chapter>, ContentError> {
        let state = self.state.lock().await;
        Ok(state.chapters.iter().find(|c| c.url == chapter_url).cloned())
    }

    async fn chapters(&self, book_url: &str) -> Result<Vec<Chapter>, ContentError> {
        let state = self.state.lock().await;
        if state.book.url != book_url {
            return Ok(Vec::new());
        }
        Ok(state.chapters.clone())
    }

    async fn set_as_read(&self, chapter_url: &str, read: bool) -> Result<(), ContentError> {
        self.update_chapter(chapter_url, |chapter| chapter.read = read).await
    }

    async fn update_chapter_position(&self, chapter_url: &str, position: usize, offset: i32) -> Result<(), ContentError> {
        self.update_chapter(chapter_url, |chapter| {
            chapter.last_read_position = position;
            chapter.last_read_offset = offset;
        })
        .await
    }

    async fn get_book(&self, book_url: &str) -> Result<Option<Book>, ContentError> {
        let state = self.state.lock().await;
        Ok((state.book.url == book_url).then(|| state.book.clone()))
    }

    async fn update_last_read_chapter(&self, book_url: &str, chapter_url: &str) -> Result<(), ContentError> {
        let mut state = self.state.lock().await;
        if state.book.url != book_url {
            return Err(ContentError::NotFound(book_url.to_string()));
        }
        state.book.last_read_chapter = Some(chapter_url.to_string());
        self.save_progress(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_book(dir: &Path) {
        std::fs::write(
            dir.join(BOOK_FILENAME),
            r#"
title = "Test Book"

[[chapters]]
title = "First"
file = "001.txt"

[[chapters]]
title = "Second"
file = "002.txt"
"#,
        )
        .unwrap();
        std::fs::write(dir.join("001.txt"), "One.\n\nTwo.").unwrap();
        std::fs::write(dir.join("002.txt"), "Three.").unwrap();
    }

    #[tokio::test]
    async fn test_open_and_fetch() {
        let dir = TempDir::new().unwrap();
        write_book(dir.path());

        let library = LocalLibrary::open(dir.path()).await.unwrap();
        let book = library.book().await;
        assert_eq!(book.title, "Test Book");
        assert_eq!(book.last_read_chapter, None);

        let chapters = library.chapters(&book.url).await.unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[1].title, "Second");
        assert_eq!(chapters[1].position, 1);

        let body = library.fetch_chapter_body(&chapters[0].url).await.unwrap();
        assert_eq!(body, "One.\n\nTwo.");
    }

    #[tokio::test]
    async fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let result = LocalLibrary::open(dir.path()).await;
        assert!(matches!(result, Err(ContentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_chapter_file() {
        let dir = TempDir::new().unwrap();
        write_book(dir.path());
        std::fs::remove_file(dir.path().join("002.txt")).unwrap();

        let library = LocalLibrary::open(dir.path()).await.unwrap();
        let book = library.book().await;
        let chapters = library.chapters(&book.url).await.unwrap();
        assert!(library.fetch_chapter_body(&chapters[1].url).await.is_err());
    }

    #[tokio::test]
    async fn test_progress_persists() {
        let dir = TempDir::new().unwrap();
        write_book(dir.path());

        {
            let library = LocalLibrary::open(dir.path()).await.unwrap();
            let book = library.book().await;
            let chapters = library.chapters(&book.url).await.unwrap();
            library.set_as_read(&chapters[0].url, true).await.unwrap();
            library.update_chapter_position(&chapters[1].url, 3, 42).await.unwrap();
            library.update_last_read_chapter(&book.url, &chapters[1].url).await.unwrap();
        }

        let library = LocalLibrary::open(dir.path()).await.unwrap();
        let book = library.book().await;
        let chapters = library.chapters(&book.url).await.unwrap();
        assert!(chapters[0].read);
        assert_eq!(chapters[1].last_read_position, 3);
        assert_eq!(chapters[1].last_read_offset, 42);
        assert_eq!(book.last_read_chapter.as_deref(), Some(chapters[1].url.as_str()));
    }
}
