//! Addressing for coordinator to page traffic.

use crate::messages::{PageId, PageMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub type PageSender = mpsc::UnboundedSender<PageMessage>;
pub type PageReceiver = mpsc::UnboundedReceiver<PageMessage>;

/// Open pages and their inboxes.
///
/// Sending to a page that has closed or navigated away is not an error; the
/// message is dropped and the page is forgotten.
#[derive(Clone, Default)]
pub struct PageRegistry {
    pages: Arc<Mutex<HashMap<PageId, PageSender>>>,
}

impl PageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page and hand back the receiving end of its inbox.
    pub fn open(&self, page: PageId) -> PageReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(page, tx);
        rx
    }

    pub fn register(&self, page: PageId, sender: PageSender) {
        let Ok(mut pages) = self.pages.lock() else {
            warn!(%page, "Page registry lock poisoned; page not registered");
            return;
        };
        if pages.insert(page, sender).is_some() {
            debug!(%page, "Replaced existing page inbox");
        }
    }

    pub fn unregister(&self, page: PageId) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.remove(&page);
        }
    }

    /// Deliver to one page. Returns whether the page was still listening.
    pub fn send(&self, page: PageId, message: PageMessage) -> bool {
        let Ok(mut pages) = self.pages.lock() else {
            return false;
        };
        let action = message.action();
        let delivered = match pages.get(&page) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        };
        if delivered {
            trace!(%page, action, "Delivered page message");
        } else {
            debug!(%page, action, "Page gone; dropping message");
            pages.remove(&page);
        }
        delivered
    }

    pub fn broadcast(&self, message: PageMessage) {
        let Ok(mut pages) = self.pages.lock() else {
            return;
        };
        let action = message.action();
        pages.retain(|page, sender| {
            let alive = sender.send(message.clone()).is_ok();
            if !alive {
                debug!(%page, action, "Dropping closed page during broadcast");
            }
            alive
        });
        trace!(action, pages = pages.len(), "Broadcast page message");
    }

    pub fn pages(&self) -> Vec<PageId> {
        match self.pages.lock() {
            Ok(pages) => {
                let mut ids: Vec<PageId> = pages.keys().copied().collect();
                ids.sort();
                ids
            }
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_pages_are_dropped_silently() {
        let registry = PageRegistry::new();
        let mut open = registry.open(PageId(1));
        let closed = registry.open(PageId(2));
        drop(closed);

        assert!(!registry.send(PageId(2), PageMessage::StopAudio));
        assert!(!registry.send(PageId(9), PageMessage::StopAudio));
        registry.broadcast(PageMessage::PauseAudio);

        assert_eq!(registry.pages(), vec![PageId(1)]);
        assert_eq!(open.try_recv().ok(), Some(PageMessage::PauseAudio));
    }
}
