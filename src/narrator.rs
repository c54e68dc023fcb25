//! Speech engine that narrates to the terminal.
//!
//! Each utterance is printed when it starts playing and is held for the time
//! it would take to read aloud at the configured pace.

use crate::console::Console;
use crate::speech::{PlayState, SpeechEngine, Utterance, Voice};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Voice used until another one is selected.
pub const DEFAULT_VOICE: &str = "narrator";

/// Capacity of the utterance event channel.
const EVENT_CAPACITY: usize = 64;

/// Time needed to read `text` aloud at `words_per_minute`.
pub fn speaking_time(text: &str, words_per_minute: u32) -> Duration {
    let words = text.split_whitespace().count().max(1) as u64;
    Duration::from_millis(words * 60_000 / u64::from(words_per_minute.max(1)))
}

fn available_voices() -> Vec<Voice> {
    vec![
        Voice {
            id: DEFAULT_VOICE.to_string(),
            name: "Narrator".to_string(),
            language: "en".to_string(),
        },
        Voice {
            id: "storyteller".to_string(),
            name: "Storyteller".to_string(),
            language: "en".to_string(),
        },
    ]
}

struct Queued {
    text: String,
    utterance: Utterance,
}

struct NarratorState {
    queue: VecDeque<Queued>,
    current: Option<Utterance>,
    voice: Voice,
    /// Bumped by every stop so an interrupted utterance is never finished.
    epoch: u64,
}

struct NarratorShared {
    console: Console,
    words_per_minute: u32,
    state: Mutex<NarratorState>,
    events: broadcast::Sender<Utterance>,
    wake: Notify,
    interrupt: Notify,
}

/// Prints narration to the console at reading pace.
pub struct ConsoleNarrator {
    shared: Arc<NarratorShared>,
    cancel: CancellationToken,
}

impl ConsoleNarrator {
    /// Must be called from within a Tokio runtime.
    pub fn new(console: Console, words_per_minute: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let voice = available_voices().remove(0);
        let shared = Arc::new(NarratorShared {
            console,
            words_per_minute,
            state: Mutex::new(NarratorState {
                queue: VecDeque::new(),
                current: None,
                voice,
                epoch: 0,
            }),
            events,
            wake: Notify::new(),
            interrupt: Notify::new(),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(narrate(shared.clone(), cancel.clone()));
        Self { shared, cancel }
    }
}

impl Drop for ConsoleNarrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SpeechEngine for ConsoleNarrator {
    fn speak(&self, text: &str, utterance: Utterance) {
        self.shared.state.lock().queue.push_back(Queued {
            text: text.to_string(),
            utterance,
        });
        self.shared.wake.notify_one();
    }

    fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.queue.clear();
            state.epoch += 1;
        }
        self.shared.interrupt.notify_waiters();
    }

    fn queued(&self) -> Vec<Utterance> {
        self.shared.state.lock().queue.iter().map(|q| q.utterance).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<Utterance> {
        self.shared.events.subscribe()
    }

    fn current(&self) -> Option<Utterance> {
        self.shared.state.lock().current
    }

    fn set_current(&self, utterance: Utterance) {
        self.shared.state.lock().current = Some(utterance);
    }

    fn voices(&self) -> Vec<Voice> {
        available_voices()
    }

    fn set_voice(&self, id: &str) -> bool {
        let Some(voice) = available_voices().into_iter().find(|v| v.id == id) else {
            return false;
        };
        debug!("Narrating with voice {}", voice.name);
        self.shared.state.lock().voice = voice;
        true
    }
}

async fn narrate(shared: Arc<NarratorShared>, cancel: CancellationToken) {
    loop {
        let next = {
            let state = shared.state.lock();
            state
                .queue
                .front()
                .map(|q| (q.text.clone(), q.utterance, state.epoch, state.voice.name.to_uppercase()))
        };

        let Some((text, utterance, epoch, voice)) = next else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = shared.wake.notified() => {}
            }
            continue;
        };

        let playing = utterance.with_state(PlayState::Playing);
        shared.state.lock().current = Some(playing);
        let _ = shared.events.send(playing);
        shared.console.narration(&voice, &text);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.interrupt.notified() => {}
            _ = tokio::time::sleep(speaking_time(&text, shared.words_per_minute)) => {}
        }

        let finished = {
            let mut state = shared.state.lock();
            if state.epoch != epoch {
                None
            } else {
                state.queue.pop_front();
                let finished = utterance.with_state(PlayState::Finished);
                state.current = Some(finished);
                Some(finished)
            }
        };
        if let Some(finished) = finished {
            let _ = shared.events.send(finished);
        }
    }
}
