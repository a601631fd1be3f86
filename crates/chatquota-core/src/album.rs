use chatquota_ipc::{InboundMessage, MessageHandle, SenderInfo};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlbumKey {
    pub room_id: i64,
    pub album_id: String,
}

impl AlbumKey {
    pub fn new(room_id: i64, album_id: &str) -> Self {
        Self {
            room_id,
            album_id: album_id.to_string(),
        }
    }
}

impl std::fmt::Display for AlbumKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "room={} album={}", self.room_id, self.album_id)
    }
}

#[derive(Debug, Clone)]
pub struct AlbumBuffer {
    pub sender: SenderInfo,
    pub room_title: Option<String>,
    pub trace_id: String,
    /// In arrival order; the first one represents the album.
    pub handles: Vec<MessageHandle>,
    /// First non-empty text or caption.
    pub text: Option<String>,
    pub has_media: bool,
    pub opened_at: Instant,
}

impl AlbumBuffer {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn has_media_without_caption(&self) -> bool {
        self.has_media && self.text.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumPush {
    /// First item of a new album; the caller schedules the debounce timer.
    Opened,
    Appended,
    /// The buffer is full and the item was not taken.
    Full,
    /// The album was already processed.
    Closed,
}

/// Groups album items by (room, album id) until their debounce timer fires.
pub struct AlbumAggregator {
    buffers: HashMap<AlbumKey, AlbumBuffer>,
    fired: VecDeque<(AlbumKey, Instant)>,
    max_items: usize,
    history_limit: usize,
    stale_after: Duration,
}

impl AlbumAggregator {
    pub fn new(max_items: usize, history_limit: usize, stale_after: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            fired: VecDeque::new(),
            max_items: max_items.max(1),
            history_limit,
            stale_after,
        }
    }

    pub fn push(&mut self, key: AlbumKey, message: &InboundMessage, now: Instant) -> AlbumPush {
        if self.fired.iter().any(|(fired, _)| *fired == key) {
            return AlbumPush::Closed;
        }

        let body = message.body_text().trim();
        let text = (!body.is_empty()).then(|| message.body_text().to_string());

        match self.buffers.get_mut(&key) {
            Some(buffer) => {
                if buffer.handles.len() >= self.max_items {
                    return AlbumPush::Full;
                }
                buffer.handles.push(message.handle());
                buffer.has_media |= message.media.is_some();
                if buffer.text.is_none() {
                    buffer.text = text;
                }
                AlbumPush::Appended
            }
            None => {
                let sender = message.sender.clone().unwrap_or_default();
                self.buffers.insert(
                    key,
                    AlbumBuffer {
                        sender,
                        room_title: message.room_title.clone(),
                        trace_id: message.trace_id.clone(),
                        handles: vec![message.handle()],
                        text,
                        has_media: message.media.is_some(),
                        opened_at: now,
                    },
                );
                AlbumPush::Opened
            }
        }
    }

    /// Removes the buffer for processing. Only the first call for a key returns it.
    pub fn take(&mut self, key: &AlbumKey, now: Instant) -> Option<AlbumBuffer> {
        let buffer = self.buffers.remove(key)?;
        self.fired.push_back((key.clone(), now));
        while self.fired.len() > self.history_limit {
            self.fired.pop_front();
        }
        Some(buffer)
    }

    /// Drops buffers and fired-album history older than the stale bound.
    pub fn prune(&mut self, now: Instant) -> usize {
        let stale_after = self.stale_after;
        let before = self.buffers.len() + self.fired.len();

        self.buffers
            .retain(|_, buffer| now.saturating_duration_since(buffer.opened_at) < stale_after);
        self.fired
            .retain(|(_, fired_at)| now.saturating_duration_since(*fired_at) < stale_after);

        before - (self.buffers.len() + self.fired.len())
    }

    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatquota_ipc::MediaKind;

    const ROOM: i64 = -1001234567890;

    fn photo(message_id: i64) -> InboundMessage {
        InboundMessage::new("telegram", ROOM, message_id)
            .with_sender(SenderInfo {
                id: 42,
                ..SenderInfo::default()
            })
            .with_media(MediaKind::Photo)
            .with_album_id("album-1")
    }

    fn aggregator() -> AlbumAggregator {
        AlbumAggregator::new(10, 100, Duration::from_secs(60))
    }

    #[test]
    fn first_caption_wins() {
        let mut albums = aggregator();
        let key = AlbumKey::new(ROOM, "album-1");
        let now = Instant::now();

        assert_eq!(albums.push(key.clone(), &photo(1), now), AlbumPush::Opened);
        assert_eq!(
            albums.push(key.clone(), &photo(2).with_caption("first caption"), now),
            AlbumPush::Appended
        );
        assert_eq!(
            albums.push(key.clone(), &photo(3).with_caption("second caption"), now),
            AlbumPush::Appended
        );

        let buffer = albums.take(&key, now).expect("buffer");
        assert_eq!(buffer.text(), "first caption");
        assert_eq!(buffer.handles.len(), 3);
        assert_eq!(buffer.handles[0].message_id, 1);
        assert!(!buffer.has_media_without_caption());
        assert_eq!(buffer.sender.id, 42);
    }

    #[test]
    fn take_is_single_shot() {
        let mut albums = aggregator();
        let key = AlbumKey::new(ROOM, "album-1");
        let now = Instant::now();
        albums.push(key.clone(), &photo(1), now);

        assert!(albums.take(&key, now).is_some());
        assert!(albums.take(&key, now).is_none());
        assert_eq!(albums.push(key, &photo(2), now), AlbumPush::Closed);
    }

    #[test]
    fn buffer_is_capped() {
        let mut albums = AlbumAggregator::new(2, 100, Duration::from_secs(60));
        let key = AlbumKey::new(ROOM, "album-1");
        let now = Instant::now();

        albums.push(key.clone(), &photo(1), now);
        albums.push(key.clone(), &photo(2), now);
        assert_eq!(albums.push(key.clone(), &photo(3), now), AlbumPush::Full);
        assert_eq!(albums.take(&key, now).expect("buffer").handles.len(), 2);
    }

    #[test]
    fn prune_drops_stale_entries() {
        let mut albums = AlbumAggregator::new(10, 100, Duration::from_secs(60));
        let start = Instant::now();
        albums.push(AlbumKey::new(ROOM, "old"), &photo(1), start);
        albums.take(&AlbumKey::new(ROOM, "old"), start);
        albums.push(AlbumKey::new(ROOM, "stuck"), &photo(2), start);

        let later = start + Duration::from_secs(61);
        albums.push(AlbumKey::new(ROOM, "fresh"), &photo(3), later);

        assert_eq!(albums.prune(later), 2);
        assert_eq!(albums.pending(), 1);
        assert_eq!(
            albums.push(AlbumKey::new(ROOM, "old"), &photo(4), later),
            AlbumPush::Opened
        );
    }

    #[test]
    fn history_is_bounded() {
        let mut albums = AlbumAggregator::new(10, 2, Duration::from_secs(60));
        let now = Instant::now();
        for id in ["a", "b", "c"] {
            let key = AlbumKey::new(ROOM, id);
            albums.push(key.clone(), &photo(1), now);
            albums.take(&key, now);
        }
        assert_eq!(
            albums.push(AlbumKey::new(ROOM, "a"), &photo(9), now),
            AlbumPush::Opened
        );
        assert_eq!(
            albums.push(AlbumKey::new(ROOM, "c"), &photo(9), now),
            AlbumPush::Closed
        );
    }
}
