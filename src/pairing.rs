// src/pairing.rs

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{PairingDecision, PairingTicket};

/// 配对请求的阻塞等待上限
pub const PAIRING_TIMEOUT_SECS: u64 = 60;

/// 超时瞬间若决定已在进行中，额外等待收尾的窗口
const DECISION_GRACE_SECS: u64 = 5;

/// 等到 watch 通道出现终态决定
async fn wait_terminal(rx: &mut watch::Receiver<PairingDecision>) -> PairingDecision {
    loop {
        if rx.borrow().is_terminal() {
            return rx.borrow().clone();
        }
        if rx.changed().await.is_err() {
            return PairingDecision::Expired;
        }
    }
}

/// 等待方最终拿到的结果
#[derive(Debug, Clone)]
pub enum PairingOutcome {
    Approved { device_key: String },
    Denied,
    Expired,
}

struct TicketEntry {
    ticket: PairingTicket,
    /// 决定进行中（设备创建尚未落盘），防止并发二次决定
    deciding: bool,
    tx: watch::Sender<PairingDecision>,
}

/// 配对代理：撮合设备发起的请求与操作员的带外决定。
/// 票据只存内存，进程重启即作废。
pub struct PairingBroker {
    tickets: RwLock<HashMap<Uuid, TicketEntry>>,
    /// (client_ip, device_name) -> 进行中的票据，用于去重客户端重试
    by_origin: RwLock<HashMap<(IpAddr, String), Uuid>>,
}

/// 决定阶段第一步的结果
pub enum Claim {
    /// 本次调用获得决定权，携带创建设备所需的信息
    Granted(PairingTicket),
    /// 已有先前的决定，按幂等语义返回
    AlreadyDecided(PairingDecision),
}

impl PairingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tickets: RwLock::new(HashMap::new()),
            by_origin: RwLock::new(HashMap::new()),
        })
    }

    /// 创建或复用票据。同源同名的重试窗口内返回既有 Pending 票据，
    /// 避免操作员看到两次弹窗
    pub async fn begin(
        &self,
        device_name: String,
        platform: String,
        client_version: String,
        client_ip: IpAddr,
    ) -> (Uuid, watch::Receiver<PairingDecision>, bool) {
        self.sweep_expired().await;

        let origin = (client_ip, device_name.clone());
        {
            let by_origin = self.by_origin.read().await;
            let tickets = self.tickets.read().await;
            if let Some(existing_id) = by_origin.get(&origin) {
                if let Some(entry) = tickets.get(existing_id) {
                    if entry.ticket.decision == PairingDecision::Pending {
                        return (*existing_id, entry.tx.subscribe(), false);
                    }
                }
            }
        }

        let ticket = PairingTicket::new(device_name, platform, client_version, client_ip);
        let id = ticket.pairing_id;
        let (tx, rx) = watch::channel(PairingDecision::Pending);

        self.tickets.write().await.insert(
            id,
            TicketEntry {
                ticket,
                deciding: false,
                tx,
            },
        );
        self.by_origin.write().await.insert(origin, id);

        (id, rx, true)
    }

    pub async fn get(&self, id: Uuid) -> Option<PairingTicket> {
        self.tickets.read().await.get(&id).map(|e| e.ticket.clone())
    }

    /// 申请决定权。终态票据返回先前结果（幂等）
    pub async fn claim(&self, id: Uuid) -> AppResult<Claim> {
        let mut tickets = self.tickets.write().await;
        let entry = tickets
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("pairing ticket {}", id)))?;

        if entry.ticket.decision.is_terminal() {
            return Ok(Claim::AlreadyDecided(entry.ticket.decision.clone()));
        }
        if entry.deciding {
            return Ok(Claim::AlreadyDecided(PairingDecision::Approved));
        }
        entry.deciding = true;
        Ok(Claim::Granted(entry.ticket.clone()))
    }

    /// 设备创建成功后敲定批准，唤醒等待方
    pub async fn finish_approved(&self, id: Uuid, device_key: String) {
        let mut tickets = self.tickets.write().await;
        if let Some(entry) = tickets.get_mut(&id) {
            entry.ticket.decision = PairingDecision::Approved;
            entry.ticket.result_device_key = Some(device_key);
            entry.deciding = false;
            let _ = entry.tx.send(PairingDecision::Approved);
        }
    }

    /// 设备创建失败时退回决定权，票据保持 Pending
    pub async fn release_claim(&self, id: Uuid) {
        let mut tickets = self.tickets.write().await;
        if let Some(entry) = tickets.get_mut(&id) {
            entry.deciding = false;
        }
    }

    /// 拒绝配对。幂等：终态时返回先前结果
    pub async fn deny(&self, id: Uuid) -> AppResult<PairingDecision> {
        let mut tickets = self.tickets.write().await;
        let entry = tickets
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("pairing ticket {}", id)))?;

        if entry.ticket.decision.is_terminal() {
            return Ok(entry.ticket.decision.clone());
        }
        if entry.deciding {
            return Ok(PairingDecision::Approved);
        }
        entry.ticket.decision = PairingDecision::Denied;
        let _ = entry.tx.send(PairingDecision::Denied);
        Ok(PairingDecision::Denied)
    }

    /// 等待方超时：Pending 票据迁移到 Expired
    async fn expire(&self, id: Uuid) {
        let mut tickets = self.tickets.write().await;
        if let Some(entry) = tickets.get_mut(&id) {
            if entry.ticket.decision == PairingDecision::Pending && !entry.deciding {
                entry.ticket.decision = PairingDecision::Expired;
                let _ = entry.tx.send(PairingDecision::Expired);
            }
        }
    }

    async fn is_deciding(&self, id: Uuid) -> bool {
        self.tickets
            .read()
            .await
            .get(&id)
            .map(|e| e.deciding)
            .unwrap_or(false)
    }

    /// 阻塞等待决定。结果已敲定时票据随返回一起移除；
    /// 决定仍在进行中的票据保留给 finish_approved
    pub async fn wait(
        &self,
        id: Uuid,
        mut rx: watch::Receiver<PairingDecision>,
    ) -> PairingOutcome {
        let deadline = tokio::time::Duration::from_secs(PAIRING_TIMEOUT_SECS);
        let result = tokio::time::timeout(deadline, wait_terminal(&mut rx)).await;

        if result.is_err() {
            self.expire(id).await;
            // 操作员已领取决定权但设备创建尚未落盘：
            // 决定已经生效，给收尾一个宽限窗口而不是误报超时
            if self.is_deciding(id).await {
                let grace = tokio::time::Duration::from_secs(DECISION_GRACE_SECS);
                let _ = tokio::time::timeout(grace, wait_terminal(&mut rx)).await;
            }
        }

        let (outcome, in_flight) = {
            let tickets = self.tickets.read().await;
            match tickets.get(&id) {
                Some(entry) => {
                    let outcome = match entry.ticket.decision {
                        PairingDecision::Approved => PairingOutcome::Approved {
                            device_key: entry.ticket.result_device_key.clone().unwrap_or_default(),
                        },
                        PairingDecision::Denied => PairingOutcome::Denied,
                        _ => PairingOutcome::Expired,
                    };
                    (outcome, entry.deciding)
                }
                None => (PairingOutcome::Expired, false),
            }
        };

        // 进行中的票据不丢弃，finish_approved 还要写入结果；
        // 之后由 sweep_expired 回收
        if !in_flight {
            self.discard(id).await;
        }
        outcome
    }

    /// 初始方读取结果后丢弃票据
    async fn discard(&self, id: Uuid) {
        let mut tickets = self.tickets.write().await;
        if let Some(entry) = tickets.remove(&id) {
            let origin = (entry.ticket.client_ip, entry.ticket.device_name.clone());
            self.by_origin.write().await.remove(&origin);
        }
    }

    /// 清理超龄未领取的票据
    async fn sweep_expired(&self) {
        let cutoff = Utc::now() - Duration::seconds(PAIRING_TIMEOUT_SECS as i64 * 2);
        let mut tickets = self.tickets.write().await;
        let stale: Vec<Uuid> = tickets
            .iter()
            .filter(|(_, e)| e.ticket.created_at < cutoff)
            .map(|(id, _)| *id)
            .collect();

        if stale.is_empty() {
            return;
        }
        let mut by_origin = self.by_origin.write().await;
        for id in stale {
            if let Some(entry) = tickets.remove(&id) {
                by_origin.remove(&(entry.ticket.client_ip, entry.ticket.device_name));
            }
        }
    }

    /// 最早创建的待决票据
    pub async fn first_pending(&self) -> Option<Uuid> {
        self.tickets
            .read()
            .await
            .values()
            .filter(|e| e.ticket.decision == PairingDecision::Pending && !e.deciding)
            .min_by_key(|e| e.ticket.created_at)
            .map(|e| e.ticket.pairing_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.tickets
            .read()
            .await
            .values()
            .filter(|e| e.ticket.decision == PairingDecision::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 30));

    #[tokio::test]
    async fn test_approve_wakes_waiter() {
        let broker = PairingBroker::new();
        let (id, rx, is_new) = broker
            .begin("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await;
        assert!(is_new);

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait(id, rx).await })
        };

        match broker.claim(id).await.unwrap() {
            Claim::Granted(ticket) => {
                assert_eq!(ticket.device_name, "phone-A");
                broker.finish_approved(id, "the-device-key".into()).await;
            }
            Claim::AlreadyDecided(_) => panic!("first claim must be granted"),
        }

        match waiter.await.unwrap() {
            PairingOutcome::Approved { device_key } => assert_eq!(device_key, "the-device-key"),
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deny_wakes_waiter() {
        let broker = PairingBroker::new();
        let (id, rx, _) = broker
            .begin("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await;

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait(id, rx).await })
        };

        broker.deny(id).await.unwrap();
        assert!(matches!(waiter.await.unwrap(), PairingOutcome::Denied));
    }

    #[tokio::test]
    async fn test_second_decision_is_noop() {
        let broker = PairingBroker::new();
        let (id, _rx, _) = broker
            .begin("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await;

        assert!(matches!(broker.claim(id).await.unwrap(), Claim::Granted(_)));
        broker.finish_approved(id, "key".into()).await;

        // 第二次决定拿到先前结果
        assert!(matches!(
            broker.claim(id).await.unwrap(),
            Claim::AlreadyDecided(PairingDecision::Approved)
        ));
        assert!(matches!(
            broker.deny(id).await.unwrap(),
            PairingDecision::Approved
        ));
    }

    #[tokio::test]
    async fn test_duplicate_request_reuses_ticket() {
        let broker = PairingBroker::new();
        let (id1, _rx1, new1) = broker
            .begin("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await;
        let (id2, _rx2, new2) = broker
            .begin("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await;

        assert!(new1);
        assert!(!new2);
        assert_eq!(id1, id2);

        // 不同名字产生新票据
        let (id3, _rx3, new3) = broker
            .begin("phone-B".into(), "android".into(), "1.0".into(), IP)
            .await;
        assert!(new3);
        assert_ne!(id1, id3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires_ticket() {
        let broker = PairingBroker::new();
        let (id, rx, _) = broker
            .begin("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await;

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait(id, rx).await })
        };

        // 让等待方先注册好定时器
        tokio::task::yield_now().await;
        tokio::time::advance(tokio::time::Duration::from_secs(PAIRING_TIMEOUT_SECS + 1)).await;
        assert!(matches!(waiter.await.unwrap(), PairingOutcome::Expired));

        // 票据已被丢弃
        assert!(broker.get(id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_approval_survives_timeout() {
        let broker = PairingBroker::new();
        let (id, rx, _) = broker
            .begin("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await;

        // 操作员已领取决定权，设备创建还在进行
        assert!(matches!(broker.claim(id).await.unwrap(), Claim::Granted(_)));

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait(id, rx).await })
        };
        tokio::task::yield_now().await;

        // 60 秒期限越过时决定仍未落盘
        tokio::time::advance(tokio::time::Duration::from_secs(PAIRING_TIMEOUT_SECS + 1)).await;
        tokio::task::yield_now().await;

        // 宽限窗口内收尾，等待方必须拿到真实结果而不是超时
        broker.finish_approved(id, "late-key".into()).await;
        match waiter.await.unwrap() {
            PairingOutcome::Approved { device_key } => assert_eq!(device_key, "late-key"),
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_claim_allows_retry() {
        let broker = PairingBroker::new();
        let (id, _rx, _) = broker
            .begin("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await;

        assert!(matches!(broker.claim(id).await.unwrap(), Claim::Granted(_)));
        broker.release_claim(id).await;
        // 设备创建失败后可以再次决定
        assert!(matches!(broker.claim(id).await.unwrap(), Claim::Granted(_)));
    }
}
