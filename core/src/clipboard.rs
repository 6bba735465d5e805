//! Clipboard abstraction (component E).

use crate::error::Result;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum ClipboardContent {
    Empty,
    Text(String),
    Image { mime: String, width: u32, height: u32, bytes: Vec<u8> },
    Files(Vec<PathBuf>),
}

pub trait ClipboardAdapter: Send + Sync {
    fn read(&self) -> Result<ClipboardContent>;
    fn write_text(&self, text: &str) -> Result<()>;
    fn write_image(&self, mime: &str, width: u32, height: u32, bytes: &[u8]) -> Result<()>;
    fn write_files(&self, paths: &[PathBuf]) -> Result<()>;
    fn subscribe(&self, callback: Box<dyn Fn(ClipboardContent) + Send + Sync>) -> Result<()>;
}

/// In-memory clipboard for tests: no platform pasteboard access, content and
/// subscriber callbacks live entirely in process.
pub struct MockClipboard {
    content: Arc<Mutex<ClipboardContent>>,
    callbacks: Arc<Mutex<Vec<Box<dyn Fn(ClipboardContent) + Send + Sync>>>>,
}

impl MockClipboard {
    pub fn new() -> Self {
        Self { content: Arc::new(Mutex::new(ClipboardContent::Empty)), callbacks: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Simulates a user copy action, triggering every subscriber.
    pub fn simulate_copy(&self, content: ClipboardContent) {
        *self.content.lock().unwrap() = content.clone();
        for cb in self.callbacks.lock().unwrap().iter() {
            cb(content.clone());
        }
    }
}

impl Default for MockClipboard {
    fn default() -> Self {
        Self::new()
    }
}

impl ClipboardAdapter for MockClipboard {
    fn read(&self) -> Result<ClipboardContent> {
        Ok(self.content.lock().unwrap().clone())
    }

    fn write_text(&self, text: &str) -> Result<()> {
        *self.content.lock().unwrap() = ClipboardContent::Text(text.to_string());
        Ok(())
    }

    fn write_image(&self, mime: &str, width: u32, height: u32, bytes: &[u8]) -> Result<()> {
        *self.content.lock().unwrap() = ClipboardContent::Image { mime: mime.to_string(), width, height, bytes: bytes.to_vec() };
        Ok(())
    }

    fn write_files(&self, paths: &[PathBuf]) -> Result<()> {
        *self.content.lock().unwrap() = ClipboardContent::Files(paths.to_vec());
        Ok(())
    }

    fn subscribe(&self, callback: Box<dyn Fn(ClipboardContent) + Send + Sync>) -> Result<()> {
        self.callbacks.lock().unwrap().push(callback);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_read_write_text() {
        let clip = MockClipboard::new();
        assert_eq!(clip.read().unwrap(), ClipboardContent::Empty);
        clip.write_text("hello").unwrap();
        assert_eq!(clip.read().unwrap(), ClipboardContent::Text("hello".into()));
    }

    #[test]
    fn mock_read_write_image() {
        let clip = MockClipboard::new();
        clip.write_image("image/png", 2, 2, &[1, 2, 3]).unwrap();
        assert_eq!(clip.read().unwrap(), ClipboardContent::Image { mime: "image/png".into(), width: 2, height: 2, bytes: vec![1, 2, 3] });
    }

    #[test]
    fn mock_read_write_files() {
        let clip = MockClipboard::new();
        let paths = vec![PathBuf::from("/tmp/a.txt"), PathBuf::from("/tmp/b.txt")];
        clip.write_files(&paths).unwrap();
        assert_eq!(clip.read().unwrap(), ClipboardContent::Files(paths));
    }

    #[test]
    fn subscribers_see_simulated_copies() {
        let clip = MockClipboard::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        clip.subscribe(Box::new(move |c| r.lock().unwrap().push(c))).unwrap();
        clip.simulate_copy(ClipboardContent::Text("test".into()));
        assert_eq!(received.lock().unwrap().len(), 1);
    }
}
