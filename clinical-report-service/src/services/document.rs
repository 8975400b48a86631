/// Converts an uploaded document into the text the pipeline reads.
pub trait DocumentTextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> anyhow::Result<String>;
}

/// Reads the bytes as UTF-8, replacing invalid sequences.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl DocumentTextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8]) -> anyhow::Result<String> {
        let text = String::from_utf8_lossy(bytes);
        Ok(text.trim_start_matches('\u{feff}').to_string())
    }
}
