//! Shiori CLI - read and narrate books stored on disk.

use anyhow::{Context, Result};
use clap::Parser;
use shiori::chapter::{Book, Chapter, ChapterState, order_chapters};
use shiori::config::Config;
use shiori::console::Console;
use shiori::index::index_of_reader_item;
use shiori::item::{ItemKind, Location, ReaderItem};
use shiori::loader::{ChapterLoaded, LoaderEvent, LoaderOptions, initial_chapter_position};
use shiori::narrator::ConsoleNarrator;
use shiori::repository::{ContentRepository, LocalLibrary};
use shiori::session::ReaderSession;
use shiori::speaker::SpeakerEvent;
use shiori::speech::SpeechEngine;
use shiori::translation::NoTranslation;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// Chapter-streaming book reader.
#[derive(Parser, Debug)]
#[command(name = "shiori")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Book directory, absolute or relative to the library directory.
    book_dir: PathBuf,

    /// Open chapter N (1-based) instead of the last read one.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    chapter: Option<u32>,

    /// Number of chapters to page through after the opened one.
    #[arg(long)]
    chapters: Option<usize>,

    /// Read the book aloud from the opened chapter.
    #[arg(long)]
    narrate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shiori=info")))
        .with_writer(std::io::stderr)
        .init();

    let console = Console::new();
    console.section("Shiori - Book Reader");

    // Load configuration
    console.step("Loading configuration...");
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    console.success("Configuration loaded");

    // Open the book
    let book_dir = resolve_book_dir(&args.book_dir, &config)?;
    console.step(&format!("Opening {}...", book_dir.display()));
    let library = Arc::new(
        LocalLibrary::open(&book_dir)
            .await
            .with_context(|| format!("Failed to open book at {}", book_dir.display()))?,
    );
    let book = library.book().await;
    let chapters = order_chapters(library.chapters(&book.url).await?);
    if chapters.is_empty() {
        anyhow::bail!("{} has no chapters", book.title);
    }
    console.success(&format!("Found: {} ({} chapters)", book.title, chapters.len()));

    let chapter_index = select_chapter(args.chapter, &book, &chapters)?;
    let (start_position, _) = initial_chapter_position(Some(&book), &chapters[chapter_index]);

    let narrator = Arc::new(ConsoleNarrator::new(console.clone(), config.speech.words_per_minute));
    if let Some(voice) = &config.speech.voice {
        if !narrator.set_voice(voice) {
            console.warning(&format!("Unknown voice '{}', using the default", voice));
        }
    }

    let options = LoaderOptions {
        translation_concurrency: config.reader.translation_concurrency,
        ..LoaderOptions::default()
    };
    let session = ReaderSession::new(
        book.url.clone(),
        chapters,
        library.clone(),
        Arc::new(NoTranslation),
        narrator,
        options,
    );

    let mut events = session.loader().subscribe();
    session.open_index(chapter_index);
    let loaded = next_chapter_loaded(&mut events).await?;

    if args.narrate {
        narrate(&session, &console, loaded.chapter_index, start_position).await?;
    } else {
        let ahead = args.chapters.unwrap_or(config.reader.chapters_ahead);
        page(&session, &console, &mut events, loaded.chapter_index, ahead).await?;
    }

    session.close().await;
    console.section("Done!");
    Ok(())
}

/// Finds the book directory as given or inside the library directory.
fn resolve_book_dir(book_dir: &Path, config: &Config) -> Result<PathBuf> {
    if book_dir.exists() {
        return Ok(book_dir.to_path_buf());
    }

    let in_library = config.library_dir()?.join(book_dir);
    if in_library.exists() {
        return Ok(in_library);
    }

    anyhow::bail!("Book directory not found: {}", book_dir.display())
}

/// Picks the chapter to open: the requested one, else the last read one.
fn select_chapter(requested: Option<u32>, book: &Book, chapters: &[Chapter]) -> Result<usize> {
    if let Some(number) = requested {
        let number = number as usize;
        if number > chapters.len() {
            anyhow::bail!("Chapter {} exceeds total chapters ({})", number, chapters.len());
        }
        return Ok(number - 1);
    }

    Ok(book
        .last_read_chapter
        .as_deref()
        .and_then(|url| chapters.iter().position(|c| c.url == url))
        .unwrap_or(0))
}

/// Waits for the next chapter to finish loading.
async fn next_chapter_loaded(events: &mut broadcast::Receiver<LoaderEvent>) -> Result<ChapterLoaded> {
    loop {
        match events.recv().await {
            Ok(LoaderEvent::ChapterLoaded(loaded)) => return Ok(loaded),
            Ok(LoaderEvent::InvalidChapter) => anyhow::bail!("Chapter could not be opened"),
            Ok(LoaderEvent::InitialPosition(_)) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => anyhow::bail!("Chapter loader stopped"),
        }
    }
}

/// Prints the opened chapter and up to `ahead` following ones.
async fn page(
    session: &ReaderSession,
    console: &Console,
    events: &mut broadcast::Receiver<LoaderEvent>,
    mut chapter_index: usize,
    ahead: usize,
) -> Result<()> {
    let chapter_count = session.loader().chapters().len();
    let mut printed = 0;

    for step in 0..=ahead {
        if step > 0 {
            if session.loader().is_last_chapter(chapter_index) {
                console.info("Reached the end of the book");
                break;
            }
            console.progress(&format!("Loading chapter {}...", chapter_index + 2));
            session.loader().try_load_next();
            chapter_index = next_chapter_loaded(events).await?.chapter_index;
            console.clear_line();
        }

        let items = session.loader().items();
        let new_items = &items[printed.min(items.len())..];
        for item in new_items {
            render_item(console, item, chapter_count);
        }
        mark_seen(session, new_items).await;
        printed = items.len();

        let last_position = items.iter().rposition(|item| item.is_position());
        if let Some(stats) = last_position.and_then(|index| session.reading_stats(index)) {
            session.set_current_chapter(ChapterState {
                chapter_url: stats.chapter_url,
                chapter_item_position: stats.chapter_item_position,
                offset: 0,
            });
        }
    }

    Ok(())
}

/// Reports the first and last paragraphs of printed chapters as seen.
async fn mark_seen(session: &ReaderSession, items: &[ReaderItem]) {
    let handles: Vec<_> = items
        .iter()
        .filter_map(|item| match item.location() {
            Some(Location::First) => Some(session.mark_chapter_start_seen(&item.chapter_url)),
            Some(Location::Last) => Some(session.mark_chapter_end_seen(&item.chapter_url)),
            _ => None,
        })
        .collect();

    for handle in handles {
        let _ = handle.await;
    }
}

/// Reads the book aloud until the last chapter has been narrated.
async fn narrate(session: &ReaderSession, console: &Console, chapter_index: usize, position: usize) -> Result<()> {
    let mut speaker_events = session.speaker().subscribe();

    let items = session.loader().items();
    let position = if index_of_reader_item(&items, chapter_index, position).is_some() {
        position
    } else {
        0
    };

    console.info("Narrating, press Ctrl+C to stop");
    session.speaker().start();
    session
        .speaker()
        .read_chapter_starting_from_chapter_item(chapter_index, position);

    loop {
        match speaker_events.recv().await {
            Ok(SpeakerEvent::ReachedChapterEnd(index)) if session.loader().is_last_chapter(index) => break,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => anyhow::bail!("Speaker stopped"),
        }
    }

    console.info("Reached the end of the book");
    Ok(())
}

fn render_item(console: &Console, item: &ReaderItem, chapter_count: usize) {
    match &item.kind {
        ItemKind::Divider => console.divider(),
        ItemKind::Title { .. } => {
            let title = item.text_to_display().unwrap_or_default();
            println!("{}", console.chapter_heading(item.chapter_index, chapter_count, title));
            println!();
        }
        ItemKind::Body { .. } => console.paragraph(item.text_to_display().unwrap_or_default()),
        ItemKind::Image { image, .. } => {
            println!("{}", console.muted(&format!("[image: {}]", image.path)));
            println!();
        }
        ItemKind::Error { message } => console.error(message),
        ItemKind::BookStart => println!("{}", console.muted("Start of book")),
        ItemKind::BookEnd => println!("{}", console.muted("End of book")),
        ItemKind::TranslationAttribution => println!("{}", console.muted("Machine translated")),
        ItemKind::Translating {
            source_language,
            target_language,
        } => println!(
            "{}",
            console.muted(&format!("Translating {} to {}...", source_language, target_language))
        ),
        ItemKind::Progressbar | ItemKind::Padding => {}
    }
}
