//! Item loading collaborator.
//!
//! The loader resolves an item name into its in-memory object set. The
//! cooker only sees the narrow interface here; the filesystem
//! implementation reads `.item` source files with a line-oriented
//! format:
//!
//! ```text
//! object <name> <class>
//! ref <item>
//! redirect <item>
//! ```
//!
//! Preloading warms the raw bytes on a background thread so the
//! blocking parse overlaps other scheduler work.

use std::io;
use std::path::PathBuf;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::item::record::{CookObject, ItemId};

/// A loaded item: its objects plus what loading it revealed.
#[derive(Debug, Clone, Default)]
pub struct LoadedItem {
    /// Objects owned by the item
    pub objects: Vec<CookObject>,
    /// Other items referenced by this one (raised as discoveries)
    pub references: Vec<ItemId>,
    /// Set when the name redirected to another item
    pub redirect: Option<ItemId>,
}

/// Handle to an in-flight preload.
#[derive(Debug)]
pub struct PreloadTicket {
    rx: Option<Receiver<io::Result<Vec<u8>>>>,
    result: Option<io::Result<Vec<u8>>>,
}

impl PreloadTicket {
    /// Ticket that is already complete.
    pub fn ready(data: Vec<u8>) -> Self {
        Self { rx: None, result: Some(Ok(data)) }
    }

    /// Ticket fed by a channel; the producer sends exactly one message.
    pub fn channel() -> (Sender<io::Result<Vec<u8>>>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx: Some(rx), result: None })
    }

    /// Poll for completion. Never blocks.
    pub fn poll(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        if let Some(rx) = &self.rx {
            if let Ok(result) = rx.try_recv() {
                self.result = Some(result);
                self.rx = None;
                return true;
            }
        }
        false
    }

    /// Take the completed bytes. `None` while still in flight or on a
    /// preload error (load falls back to a cold read).
    pub fn take(&mut self) -> Option<Vec<u8>> {
        match self.result.take() {
            Some(Ok(data)) => Some(data),
            _ => None,
        }
    }
}

/// The loading collaborator.
pub trait ItemLoader: Send {
    /// Start warming the item's import data. `None` when the loader has
    /// no preload support; load will then read cold.
    fn begin_preload(&mut self, id: &ItemId) -> Option<PreloadTicket>;

    /// Blocking load of the item, optionally from preloaded bytes.
    fn load(&mut self, id: &ItemId, preloaded: Option<Vec<u8>>) -> Result<LoadedItem, String>;
}

/// Parse the line-oriented item source format.
pub fn parse_item_source(text: &str) -> Result<LoadedItem, String> {
    let mut item = LoadedItem::default();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("object") => {
                let name = parts
                    .next()
                    .ok_or_else(|| format!("line {}: object missing name", line_no + 1))?;
                let class = parts.next().unwrap_or("default");
                item.objects.push(CookObject::new(name, class));
            }
            Some("ref") => {
                let target = parts
                    .next()
                    .ok_or_else(|| format!("line {}: ref missing target", line_no + 1))?;
                item.references.push(ItemId::new(target));
            }
            Some("redirect") => {
                let target = parts
                    .next()
                    .ok_or_else(|| format!("line {}: redirect missing target", line_no + 1))?;
                item.redirect = Some(ItemId::new(target));
            }
            Some(other) => {
                return Err(format!("line {}: unknown directive '{}'", line_no + 1, other));
            }
            None => {}
        }
    }
    Ok(item)
}

/// Filesystem loader over a source content directory.
#[derive(Debug)]
pub struct FsItemLoader {
    src_root: PathBuf,
}

impl FsItemLoader {
    /// Loader rooted at `src_root`.
    pub fn new(src_root: PathBuf) -> Self {
        Self { src_root }
    }

    fn item_path(&self, id: &ItemId) -> PathBuf {
        self.src_root.join(format!("{}.item", id))
    }
}

impl ItemLoader for FsItemLoader {
    fn begin_preload(&mut self, id: &ItemId) -> Option<PreloadTicket> {
        let path = self.item_path(id);
        let (tx, ticket) = PreloadTicket::channel();
        std::thread::spawn(move || {
            let result = std::fs::read(&path);
            // receiver may already be gone if the item was cancelled
            let _ = tx.send(result);
        });
        Some(ticket)
    }

    fn load(&mut self, id: &ItemId, preloaded: Option<Vec<u8>>) -> Result<LoadedItem, String> {
        let bytes = match preloaded {
            Some(bytes) => bytes,
            None => std::fs::read(self.item_path(id))
                .map_err(|e| format!("cannot read {}: {}", id, e))?,
        };
        let text = String::from_utf8(bytes)
            .map_err(|_| format!("{}: source is not valid UTF-8", id))?;
        parse_item_source(&text)
    }
}
