// src/hub.rs

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::models::{EventEnvelope, EventKind};

/// 每个订阅者的出站缓冲上限，打满即判定为慢消费者
const SUBSCRIBER_BUFFER: usize = 64;

/// 订阅者类别：设备端与操作员端分开投递
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberClass {
    Device,
    Operator,
}

/// 订阅者标识：所有者 + 连接序号
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    pub owner: String,
    pub seq: u64,
}

struct HubInner {
    devices: HashMap<SubscriberKey, mpsc::Sender<EventEnvelope>>,
    operators: HashMap<SubscriberKey, mpsc::Sender<EventEnvelope>>,
    next_seq: u64,
}

impl HubInner {
    fn class_map(&mut self, class: SubscriberClass) -> &mut HashMap<SubscriberKey, mpsc::Sender<EventEnvelope>> {
        match class {
            SubscriberClass::Device => &mut self.devices,
            SubscriberClass::Operator => &mut self.operators,
        }
    }
}

/// 事件枢纽：向 WebSocket 订阅者扇出事件信封。
/// 发布端永不阻塞，慢消费者被移除而不是拖慢全局。
pub struct SessionHub {
    inner: RwLock<HubInner>,
}

impl SessionHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HubInner {
                devices: HashMap::new(),
                operators: HashMap::new(),
                next_seq: 0,
            }),
        })
    }

    /// 注册订阅者，返回标识与接收端
    pub async fn subscribe(
        &self,
        class: SubscriberClass,
        owner: String,
    ) -> (SubscriberKey, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.write().await;
        inner.next_seq += 1;
        let key = SubscriberKey {
            owner,
            seq: inner.next_seq,
        };
        inner.class_map(class).insert(key.clone(), tx);
        (key, rx)
    }

    pub async fn unsubscribe(&self, class: SubscriberClass, key: &SubscriberKey) {
        self.inner.write().await.class_map(class).remove(key);
    }

    /// 发布事件。入队失败（缓冲满）即断开该订阅者
    pub async fn publish(&self, class: SubscriberClass, envelope: EventEnvelope) {
        let mut inner = self.inner.write().await;
        let map = inner.class_map(class);

        let mut dropped = Vec::new();
        for (key, tx) in map.iter() {
            match tx.try_send(envelope.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Dropping slow consumer: {} (seq {})", key.owner, key.seq);
                    dropped.push(key.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push(key.clone());
                }
            }
        }
        for key in dropped {
            // Sender 被移除后订阅者的接收循环随之结束，连接关闭
            map.remove(&key);
        }
    }

    /// 同时发布给两类订阅者
    pub async fn publish_all(&self, envelope: EventEnvelope) {
        self.publish(SubscriberClass::Device, envelope.clone()).await;
        self.publish(SubscriberClass::Operator, envelope).await;
    }

    /// 设备 WebSocket 打开：通知操作员
    pub async fn device_connected(&self, device_id: Uuid, name: &str) {
        self.publish(
            SubscriberClass::Operator,
            EventEnvelope::new(
                EventKind::DeviceConnected,
                json!({"device_id": device_id, "name": name}),
            ),
        )
        .await;
    }

    /// 设备 WebSocket 关闭：通知操作员
    pub async fn device_disconnected(&self, device_id: Uuid, name: &str) {
        self.publish(
            SubscriberClass::Operator,
            EventEnvelope::new(
                EventKind::DeviceDisconnected,
                json!({"device_id": device_id, "name": name}),
            ),
        )
        .await;
    }

    /// 当前在线设备（按 owner 去重后的设备订阅数）
    pub async fn connected_devices(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut owners: Vec<String> = inner.devices.keys().map(|k| k.owner.clone()).collect();
        owners.sort();
        owners.dedup();
        owners
    }

    pub async fn is_device_online(&self, device_id: Uuid) -> bool {
        let owner = device_id.to_string();
        self.inner
            .read()
            .await
            .devices
            .keys()
            .any(|k| k.owner == owner)
    }

    pub async fn subscriber_counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        (inner.devices.len(), inner.operators.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(n: u64) -> EventEnvelope {
        EventEnvelope::new(EventKind::Notification, json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let hub = SessionHub::new();
        let (_key, mut rx) = hub.subscribe(SubscriberClass::Operator, "op".into()).await;

        for n in 0..10u64 {
            hub.publish(SubscriberClass::Operator, envelope(n)).await;
        }

        for n in 0..10u64 {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.payload["n"], n);
        }
    }

    #[tokio::test]
    async fn test_classes_are_isolated() {
        let hub = SessionHub::new();
        let (_dk, mut device_rx) = hub.subscribe(SubscriberClass::Device, "dev".into()).await;
        let (_ok, mut operator_rx) = hub.subscribe(SubscriberClass::Operator, "op".into()).await;

        hub.publish(SubscriberClass::Operator, envelope(1)).await;

        assert!(operator_rx.recv().await.is_some());
        assert!(device_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_dropped() {
        let hub = SessionHub::new();
        // 不消费，让缓冲打满
        let (_key, _rx) = hub.subscribe(SubscriberClass::Operator, "slow".into()).await;

        for n in 0..(SUBSCRIBER_BUFFER as u64 + 8) {
            hub.publish(SubscriberClass::Operator, envelope(n)).await;
        }

        let (_, operators) = hub.subscriber_counts().await;
        assert_eq!(operators, 0);
    }

    #[tokio::test]
    async fn test_publish_does_not_block_on_full_buffer() {
        let hub = SessionHub::new();
        let (_k1, _rx1) = hub.subscribe(SubscriberClass::Operator, "slow".into()).await;
        let (_k2, mut rx2) = hub.subscribe(SubscriberClass::Operator, "fast".into()).await;

        // 慢消费者不应影响快消费者收到事件
        for n in 0..(SUBSCRIBER_BUFFER as u64 + 8) {
            hub.publish(SubscriberClass::Operator, envelope(n)).await;
            if let Ok(e) = rx2.try_recv() {
                assert_eq!(e.kind, EventKind::Notification);
            }
        }
    }

    #[tokio::test]
    async fn test_device_presence() {
        let hub = SessionHub::new();
        let id = Uuid::new_v4();

        assert!(!hub.is_device_online(id).await);
        let (key, _rx) = hub.subscribe(SubscriberClass::Device, id.to_string()).await;
        assert!(hub.is_device_online(id).await);

        hub.unsubscribe(SubscriberClass::Device, &key).await;
        assert!(!hub.is_device_online(id).await);
    }
}
