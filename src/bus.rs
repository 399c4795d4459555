//! Cross-instance broadcast bus.
//!
//! Instances sharing one origin (one backing store) exchange small JSON
//! messages: slot switches and liveness heartbeats. Delivery is best effort;
//! a lagging subscriber skips what it missed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

const BUS_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    SlotSwitch {
        #[serde(rename = "slotId")]
        slot_id: String,
    },
    Heartbeat {
        timestamp: i64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    #[serde(flatten)]
    message: BusMessage,
}

/// One instance's handle on the shared channel.
#[derive(Clone)]
pub struct Bus {
    instance: Uuid,
    tx: broadcast::Sender<String>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            instance: Uuid::new_v4(),
            tx,
        }
    }

    /// A handle for another instance on the same channel.
    pub fn sibling(&self) -> Self {
        Self {
            instance: Uuid::new_v4(),
            tx: self.tx.clone(),
        }
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn publish(&self, message: BusMessage) {
        let env = Envelope {
            origin: self.instance,
            message,
        };
        let Ok(raw) = serde_json::to_string(&env) else {
            return;
        };
        // No receivers is fine: nobody else is alive.
        let _ = self.tx.send(raw);
    }

    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            instance: self.instance,
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BusReceiver {
    instance: Uuid,
    rx: broadcast::Receiver<String>,
}

impl BusReceiver {
    /// Next message from a sibling. `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<(Uuid, BusMessage)> {
        loop {
            match self.rx.recv().await {
                Ok(raw) => {
                    let Ok(env) = serde_json::from_str::<Envelope>(&raw) else {
                        continue;
                    };
                    if env.origin == self.instance {
                        continue;
                    }
                    return Some((env.origin, env.message));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    crate::logging::warn(format!("bus subscriber lagged, skipped {n} messages"));
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Broadcast a heartbeat every `interval` until `shutdown` fires.
pub fn spawn_heartbeat(bus: Bus, interval: Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
    let stop = shutdown.notified_owned();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    bus.publish(BusMessage::Heartbeat {
                        timestamp: Utc::now().timestamp_millis(),
                    });
                }
                _ = &mut stop => break,
            }
        }
        crate::logging::debug("heartbeat stopped");
    })
}

/// Tracks the last heartbeat seen from each sibling instance so a supervisor
/// can tell which ones went quiet.
#[derive(Clone, Default)]
pub struct LivenessMonitor {
    seen: Arc<Mutex<HashMap<Uuid, i64>>>,
}

impl LivenessMonitor {
    pub fn watch(&self, bus: &Bus, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let seen = self.seen.clone();
        let stop = shutdown.notified_owned();
        tokio::spawn(async move {
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some((origin, BusMessage::Heartbeat { timestamp })) => {
                            if let Ok(mut s) = seen.lock() {
                                s.insert(origin, timestamp);
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = &mut stop => break,
                }
            }
        })
    }

    /// Number of sibling instances heard from so far.
    pub fn known(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn last_seen(&self, instance: Uuid) -> Option<i64> {
        self.seen.lock().ok()?.get(&instance).copied()
    }

    /// Instances whose last heartbeat is older than `max_age` at `now_ms`.
    pub fn stale(&self, now_ms: i64, max_age: Duration) -> Vec<Uuid> {
        let Ok(seen) = self.seen.lock() else {
            return Vec::new();
        };
        let max_age = max_age.as_millis() as i64;
        seen.iter()
            .filter(|(_, ts)| now_ms - **ts > max_age)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_serialize_as_tagged_json() {
        let raw = serde_json::to_value(BusMessage::SlotSwitch {
            slot_id: "work".into(),
        })
        .unwrap();
        assert_eq!(raw, serde_json::json!({"type": "slot_switch", "slotId": "work"}));
    }

    #[tokio::test]
    async fn siblings_receive_but_sender_does_not() {
        let a = Bus::new();
        let b = a.sibling();
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        a.publish(BusMessage::SlotSwitch {
            slot_id: "work".into(),
        });
        b.publish(BusMessage::Heartbeat { timestamp: 7 });

        let (origin, msg) = rx_b.recv().await.unwrap();
        assert_eq!(origin, a.instance());
        assert_eq!(
            msg,
            BusMessage::SlotSwitch {
                slot_id: "work".into()
            }
        );
        let (origin, msg) = rx_a.recv().await.unwrap();
        assert_eq!(origin, b.instance());
        assert_eq!(msg, BusMessage::Heartbeat { timestamp: 7 });
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ticks_until_shutdown() {
        let bus = Bus::new();
        let observer = bus.sibling();
        let mut rx = observer.subscribe();
        let shutdown = Arc::new(Notify::new());
        let handle = spawn_heartbeat(bus.clone(), Duration::from_secs(5), shutdown.clone());

        for _ in 0..3 {
            let (origin, msg) = rx.recv().await.unwrap();
            assert_eq!(origin, bus.instance());
            assert!(matches!(msg, BusMessage::Heartbeat { .. }));
        }

        shutdown.notify_waiters();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn liveness_reports_quiet_instances() {
        let bus = Bus::new();
        let quiet = bus.sibling();
        let monitor = LivenessMonitor::default();
        let shutdown = Arc::new(Notify::new());
        let handle = monitor.watch(&bus, shutdown.clone());

        quiet.publish(BusMessage::Heartbeat { timestamp: 1_000 });
        for _ in 0..50 {
            if monitor.last_seen(quiet.instance()).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(monitor.last_seen(quiet.instance()), Some(1_000));
        assert_eq!(monitor.stale(20_000, Duration::from_secs(15)), vec![quiet.instance()]);
        assert!(monitor.stale(10_000, Duration::from_secs(15)).is_empty());

        shutdown.notify_waiters();
        handle.await.unwrap();
    }
}
