//! 事件广播器
//!
//! 显式注入的订阅者注册表，带 `start()` / `stop()` 生命周期：
//!
//! - 每个订阅者一个有界通道，投递只用 `try_send`
//! - 通道已关闭的订阅者立即移除
//! - 通道已满且事件标记为 `retry` 时进入重试队列（有界，最多 3 次，5s 起指数退避）
//! - 心跳探测：超过 `heartbeat_timeout` 未成功接收任何投递的订阅者被移除
//!
//! 重试队列是唯一跨两个时间上下文访问的结构：发布路径追加，tick 消费，
//! 由 `Mutex` 保护，且从不跨 await 持有。

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SyncEvent;
use crate::config::duration_secs;

/// 广播器参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// 每个订阅者通道容量
    pub channel_capacity: usize,
    pub retry_queue_capacity: usize,
    pub max_retry_attempts: u32,
    #[serde(with = "duration_secs")]
    pub retry_base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
    /// 重试队列的消费间隔
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            retry_queue_capacity: 1024,
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            tick_interval: Duration::from_secs(1),
        }
    }
}

struct Subscriber {
    project_id: String,
    sender: mpsc::Sender<SyncEvent>,
    last_delivery: Instant,
}

type Registry = DashMap<u64, Subscriber>;

struct RetryEntry {
    subscriber_id: u64,
    event: SyncEvent,
    attempts: u32,
    next_attempt_at: Instant,
}

/// 订阅句柄；drop 时自动退订
pub struct Subscription {
    id: u64,
    project_id: String,
    receiver: mpsc::Receiver<SyncEvent>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// 等待下一个事件；订阅被移除后返回 `None`
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

/// 事件广播器
pub struct EventBroadcaster {
    config: BroadcasterConfig,
    subscribers: Arc<Registry>,
    retry_queue: Mutex<VecDeque<RetryEntry>>,
    next_id: AtomicU64,
    stopped: AtomicBool,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

enum Delivery {
    Delivered,
    Full,
    Closed,
}

impl EventBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            config,
            subscribers: Arc::new(DashMap::new()),
            retry_queue: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<RetryEntry>> {
        match self.retry_queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("[Broadcaster] 重试队列锁被污染，继续使用");
                poisoned.into_inner()
            }
        }
    }

    /// 启动重试与心跳 tick；重复调用无效
    pub fn start(self: &Arc<Self>) {
        let mut ticker = match self.ticker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ticker.is_some() || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut retry_tick = tokio::time::interval(this.config.tick_interval);
            let mut heartbeat_tick = tokio::time::interval(this.config.heartbeat_interval);
            retry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = retry_tick.tick() => {
                        this.process_retries_at(Instant::now());
                    }
                    _ = heartbeat_tick.tick() => {
                        let now = Instant::now();
                        this.heartbeat_at(now);
                        this.sweep_unresponsive_at(now);
                    }
                }
            }
            debug!("[Broadcaster] tick 循环已退出");
        }));
        info!("[Broadcaster] 已启动");
    }

    /// 停止 tick 并移除全部订阅者
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handle = match self.ticker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.subscribers.clear();
        self.lock_queue().clear();
        info!("[Broadcaster] 已停止");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// 订阅某个项目的事件
    pub fn subscribe(&self, project_id: impl Into<String>) -> Subscription {
        let project_id = project_id.into();
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if !self.is_stopped() {
            self.subscribers.insert(
                id,
                Subscriber {
                    project_id: project_id.clone(),
                    sender,
                    last_delivery: Instant::now(),
                },
            );
            debug!("[Broadcaster] 新订阅 {} (项目 {})", id, project_id);
        }
        Subscription {
            id,
            project_id,
            receiver,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn pending_retries(&self) -> usize {
        self.lock_queue().len()
    }

    fn try_deliver(subscriber: &mut Subscriber, event: SyncEvent, now: Instant) -> Delivery {
        match subscriber.sender.try_send(event) {
            Ok(()) => {
                subscriber.last_delivery = now;
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// 投递给订阅了 `event.project_id` 的订阅者，返回成功投递的数量
    ///
    /// 从不阻塞、从不失败。
    pub fn broadcast(&self, event: SyncEvent) -> usize {
        if self.is_stopped() {
            return 0;
        }
        let now = Instant::now();
        let mut delivered = 0;
        let mut full = Vec::new();
        let mut closed = Vec::new();

        for mut entry in self.subscribers.iter_mut() {
            if entry.project_id != event.project_id {
                continue;
            }
            let id = *entry.key();
            match Self::try_deliver(entry.value_mut(), event.clone(), now) {
                Delivery::Delivered => delivered += 1,
                Delivery::Full => full.push(id),
                Delivery::Closed => closed.push(id),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            debug!("[Broadcaster] 订阅 {} 通道已关闭，已移除", id);
        }

        if !full.is_empty() {
            if event.retry {
                let mut queue = self.lock_queue();
                for id in full {
                    if queue.len() >= self.config.retry_queue_capacity.max(1) {
                        if let Some(dropped) = queue.pop_front() {
                            warn!(
                                "[Broadcaster] 重试队列已满，丢弃最旧的 {} 事件 (订阅 {})",
                                dropped.event.event_type.as_str(),
                                dropped.subscriber_id
                            );
                        }
                    }
                    queue.push_back(RetryEntry {
                        subscriber_id: id,
                        event: event.clone(),
                        attempts: 0,
                        next_attempt_at: now + self.config.retry_base_delay,
                    });
                }
            } else {
                debug!(
                    "[Broadcaster] {} 个订阅者通道已满，丢弃 {} 事件",
                    full.len(),
                    event.event_type.as_str()
                );
            }
        }

        delivered
    }

    /// 处理到期的重试，返回本次成功投递的数量
    pub fn process_retries_at(&self, now: Instant) -> usize {
        let due: Vec<RetryEntry> = {
            let mut queue = self.lock_queue();
            let (due, pending): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|e| e.next_attempt_at <= now);
            *queue = pending;
            due.into_iter().collect()
        };

        let mut delivered = 0;
        let mut requeue = Vec::new();
        for mut entry in due {
            let outcome = match self.subscribers.get_mut(&entry.subscriber_id) {
                Some(mut sub) => Self::try_deliver(sub.value_mut(), entry.event.clone(), now),
                None => continue,
            };
            match outcome {
                Delivery::Delivered => delivered += 1,
                Delivery::Closed => {
                    self.subscribers.remove(&entry.subscriber_id);
                }
                Delivery::Full => {
                    entry.attempts += 1;
                    if entry.attempts >= self.config.max_retry_attempts {
                        warn!(
                            "[Broadcaster] {} 事件重试 {} 次仍未送达订阅 {}，放弃",
                            entry.event.event_type.as_str(),
                            entry.attempts,
                            entry.subscriber_id
                        );
                        continue;
                    }
                    entry.next_attempt_at =
                        now + self.config.retry_base_delay * 2u32.saturating_pow(entry.attempts);
                    requeue.push(entry);
                }
            }
        }

        if !requeue.is_empty() {
            let mut queue = self.lock_queue();
            for entry in requeue {
                if queue.len() >= self.config.retry_queue_capacity.max(1) {
                    queue.pop_front();
                }
                queue.push_back(entry);
            }
        }
        delivered
    }

    /// 向每个订阅者发送心跳探测
    pub fn heartbeat_at(&self, now: Instant) {
        if self.is_stopped() {
            return;
        }
        let mut closed = Vec::new();
        for mut entry in self.subscribers.iter_mut() {
            let id = *entry.key();
            let event = SyncEvent::heartbeat(entry.project_id.clone());
            if let Delivery::Closed = Self::try_deliver(entry.value_mut(), event, now) {
                closed.push(id);
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    /// 移除超过 `heartbeat_timeout` 未接收任何投递的订阅者，返回移除数量
    pub fn sweep_unresponsive_at(&self, now: Instant) -> usize {
        let timeout = self.config.heartbeat_timeout;
        let stale: Vec<u64> = self
            .subscribers
            .iter()
            .filter(|e| now.saturating_duration_since(e.last_delivery) > timeout)
            .map(|e| *e.key())
            .collect();
        for id in &stale {
            self.subscribers.remove(id);
            warn!("[Broadcaster] 订阅 {} 无响应超过 {:?}，已移除", id, timeout);
        }
        if !stale.is_empty() {
            self.lock_queue()
                .retain(|e| !stale.contains(&e.subscriber_id));
        }
        stale.len()
    }
}

impl Drop for EventBroadcaster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
