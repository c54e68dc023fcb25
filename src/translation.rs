//! Live translation contract consumed by the chapter loader.

use async_trait::async_trait;

/// On-the-fly translator for chapter text.
///
/// A `None` translation means the original text is rendered instead.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translates one piece of text.
    async fn translate(&self, text: &str) -> Option<String>;

    /// Whether live translation is currently enabled.
    fn is_active(&self) -> bool;

    /// Display name of the source language.
    fn source_language(&self) -> Option<String>;

    /// Display name of the target language.
    fn target_language(&self) -> Option<String>;
}

/// Translator used when live translation is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTranslation;

#[async_trait]
impl Translator for NoTranslation {
    async fn translate(&self, _text: &str) -> Option<String> {
        None
    }

    fn is_active(&self) -> bool {
        false
    }

    fn source_language(&self) -> Option<String> {
        None
    }

    fn target_language(&self) -> Option<String> {
        None
    }
}

/// Translates an optional text only while the translator is active.
pub async fn translate_if_active(translator: &dyn Translator, text: &str) -> Option<String> {
    if !translator.is_active() || text.trim().is_empty() {
        return None;
    }
    translator.translate(text).await
}
