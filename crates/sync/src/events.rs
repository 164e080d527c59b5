//! Completion events published as shards and then the whole node finish
//! syncing.

use shardsync_core::{ContractAddress, ShardId};
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ShardDone { contract: ContractAddress, shard_id: ShardId },
    AllShardDone,
}

pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event);
}

/// Multi-subscriber broadcast bus; late subscribers only see events
/// published after they subscribe, matching a fan-out notification feed
/// rather than a durable log.
#[derive(Debug)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) {
        // No subscribers is a normal state (e.g. in tests); a send error
        // here just means nobody is listening right now.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardsync_core::ContractAddress;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = BroadcastEventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Event::ShardDone {
            contract: ContractAddress::zero(),
            shard_id: 3,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            Event::ShardDone {
                contract: ContractAddress::zero(),
                shard_id: 3
            }
        );
    }
}
