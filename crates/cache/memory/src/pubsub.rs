use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

use keel_cache::backend::{MessageStream, PubSubBackend, RawMessage};
use keel_cache::error::CacheError;

use crate::store::MemoryBackend;

#[derive(Debug)]
enum Selector {
    Channels(Vec<String>),
    Patterns(Vec<(String, Regex)>),
}

#[derive(Debug)]
struct Subscriber {
    selector: Selector,
    tx: mpsc::UnboundedSender<RawMessage>,
}

/// In-process fan-out hub.
///
/// Each subscription gets its own unbounded queue; bounding is left to the
/// notification layer above. Subscribers whose stream was dropped are
/// pruned on the next publish.
#[derive(Debug, Default)]
pub(crate) struct Hub {
    next_id: AtomicU64,
    subscribers: DashMap<u64, Subscriber>,
}

impl Hub {
    fn register(&self, selector: Selector) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, Subscriber { selector, tx });
        UnboundedReceiverStream::new(rx).boxed()
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> u64 {
        let mut delivered = 0;
        let mut gone = Vec::new();

        for sub in self.subscribers.iter() {
            let messages: Vec<RawMessage> = match &sub.selector {
                Selector::Channels(channels) => channels
                    .iter()
                    .filter(|c| c.as_str() == channel)
                    .map(|_| RawMessage {
                        channel: channel.to_owned(),
                        pattern: None,
                        payload: payload.to_vec(),
                    })
                    .collect(),
                Selector::Patterns(patterns) => patterns
                    .iter()
                    .filter(|(_, re)| re.is_match(channel))
                    .map(|(pattern, _)| RawMessage {
                        channel: channel.to_owned(),
                        pattern: Some(pattern.clone()),
                        payload: payload.to_vec(),
                    })
                    .collect(),
            };

            for msg in messages {
                if sub.tx.send(msg).is_ok() {
                    delivered += 1;
                } else {
                    gone.push(*sub.key());
                    break;
                }
            }
        }

        for id in gone {
            self.subscribers.remove(&id);
        }
        trace!(channel, delivered, "published");
        delivered
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.subscribers.len()
    }
}

/// Translate a glob (`*`, `?`) into an anchored regex.
fn compile_glob(pattern: &str) -> Result<Regex, CacheError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| CacheError::Validation(format!("invalid pattern {pattern}: {e}")))
}

#[async_trait]
impl PubSubBackend for MemoryBackend {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, CacheError> {
        Ok(self.hub.publish(channel, payload))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream, CacheError> {
        Ok(self.hub.register(Selector::Channels(channels.to_vec())))
    }

    async fn psubscribe(&self, patterns: &[String]) -> Result<MessageStream, CacheError> {
        let compiled = patterns
            .iter()
            .map(|p| compile_glob(p).map(|re| (p.clone(), re)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.hub.register(Selector::Patterns(compiled)))
    }
}
