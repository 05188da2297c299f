//! 按 key 分区的连接池
//!
//! 每个 key（服务名）一个分区，分区内 `outstanding`（已创建未销毁）
//! 不超过 `max_size`，空闲连接不超过 `max_active_size`。

use crate::discover::PoolInvalidator;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use wrpc_core::{PoolConfig, Result, WrpcErr};

/// 池化对象工厂
#[async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    type Object: Send + 'static;

    async fn create(&self, key: &str) -> Result<Self::Object>;

    /// 借出前校验空闲对象，返回 `false` 的对象会被销毁
    ///
    /// 在分区锁内调用，不能阻塞。
    fn is_valid(&self, _object: &Self::Object) -> bool {
        true
    }

    /// 关闭对象，失败只记日志
    fn close(&self, key: &str, object: Self::Object);
}

struct Partition<T> {
    idle: VecDeque<T>,
    outstanding: usize,
    notify: Arc<Notify>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            outstanding: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

enum Acquire<T> {
    Idle(T),
    Reserved,
    Full,
}

pub struct KeyedPool<F: PoolFactory> {
    factory: F,
    config: PoolConfig,
    partitions: Mutex<HashMap<String, Partition<F::Object>>>,
}

impl<F: PoolFactory> KeyedPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn notifier(&self, key: &str) -> Arc<Notify> {
        self.partitions
            .lock()
            .entry(key.to_string())
            .or_default()
            .notify
            .clone()
    }

    fn try_acquire(&self, key: &str) -> Acquire<F::Object> {
        let mut stale = Vec::new();
        let acquired = {
            let mut partitions = self.partitions.lock();
            let partition = partitions.entry(key.to_string()).or_default();

            loop {
                match partition.idle.pop_back() {
                    Some(object) if self.factory.is_valid(&object) => break Acquire::Idle(object),
                    Some(object) => {
                        partition.outstanding = partition.outstanding.saturating_sub(1);
                        stale.push(object);
                    }
                    None if partition.outstanding < self.config.max_size => {
                        partition.outstanding += 1;
                        // 多腾出的名额留给等待者
                        if stale.len() > 1 {
                            partition.notify.notify_waiters();
                        }
                        break Acquire::Reserved;
                    }
                    None => break Acquire::Full,
                }
            }
        };

        if !stale.is_empty() {
            log::info!("Pool dropped {} invalid idle objects for {}", stale.len(), key);
        }
        for object in stale {
            self.factory.close(key, object);
        }
        acquired
    }

    /// 借出一个对象
    ///
    /// 优先取空闲对象；未达上限时新建；否则等待归还，超过 `wait_timeout`
    /// 返回 `PoolExhausted`。
    pub async fn borrow(&self, key: &str) -> Result<F::Object> {
        let started = Instant::now();
        let deadline = self.config.wait_timeout.map(|timeout| started + timeout);

        loop {
            let notify = self.notifier(key);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_acquire(key) {
                Acquire::Idle(object) => return Ok(object),
                Acquire::Reserved => break,
                Acquire::Full => {}
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(WrpcErr::PoolExhausted {
                            key: key.to_string(),
                            waited: started.elapsed(),
                        });
                    }
                }
                None => notified.await,
            }
        }

        let reservation = Reservation {
            pool: self,
            key,
            committed: false,
        };
        let object = self.factory.create(key).await?;
        reservation.commit();
        log::debug!("Pool created object for {}", key);
        Ok(object)
    }

    /// 归还对象，空闲数已满时直接销毁
    pub fn release(&self, key: &str, object: F::Object) {
        let overflow = {
            let mut partitions = self.partitions.lock();
            let partition = partitions.entry(key.to_string()).or_default();
            let overflow = if partition.idle.len() < self.config.max_active_size {
                partition.idle.push_back(object);
                None
            } else {
                partition.outstanding = partition.outstanding.saturating_sub(1);
                Some(object)
            };
            partition.notify.notify_one();
            overflow
        };

        if let Some(object) = overflow {
            log::debug!("Pool idle queue of {} is full, close returned object", key);
            self.factory.close(key, object);
        }
    }

    /// 销毁对象
    pub fn destroy(&self, key: &str, object: F::Object) {
        self.forget(key);
        self.factory.close(key, object);
    }

    fn forget(&self, key: &str) {
        let mut partitions = self.partitions.lock();
        if let Some(partition) = partitions.get_mut(key) {
            partition.outstanding = partition.outstanding.saturating_sub(1);
            partition.notify.notify_one();
        }
    }

    /// 关闭空闲对象，借出中的不受影响；`None` 表示所有 key
    pub fn clear(&self, key: Option<&str>) {
        let drained: Vec<(String, F::Object)> = {
            let mut partitions = self.partitions.lock();
            let mut drained = Vec::new();
            for (name, partition) in partitions.iter_mut() {
                if key.is_some_and(|k| k != name.as_str()) {
                    continue;
                }
                let count = partition.idle.len();
                partition.outstanding = partition.outstanding.saturating_sub(count);
                drained.extend(partition.idle.drain(..).map(|object| (name.clone(), object)));
                partition.notify.notify_waiters();
            }
            drained
        };

        if !drained.is_empty() {
            log::info!("Pool cleared {} idle objects", drained.len());
        }
        for (name, object) in drained {
            self.factory.close(&name, object);
        }
    }

    pub fn idle_count(&self, key: &str) -> usize {
        self.partitions
            .lock()
            .get(key)
            .map_or(0, |partition| partition.idle.len())
    }

    pub fn outstanding_count(&self, key: &str) -> usize {
        self.partitions
            .lock()
            .get(key)
            .map_or(0, |partition| partition.outstanding)
    }
}

impl<F: PoolFactory> KeyedPool<F> {
    /// 借出并包装成守卫，守卫未归还就被丢弃时对象会被销毁
    pub async fn get(self: &Arc<Self>, key: &str) -> Result<Pooled<F>> {
        let object = self.borrow(key).await?;
        Ok(Pooled {
            pool: self.clone(),
            key: key.to_string(),
            object: Some(object),
        })
    }
}

impl<F: PoolFactory> PoolInvalidator for KeyedPool<F> {
    fn clear(&self, key: Option<&str>) {
        KeyedPool::clear(self, key)
    }
}

/// 创建期间占用的名额，创建失败或被取消时归还
struct Reservation<'a, F: PoolFactory> {
    pool: &'a KeyedPool<F>,
    key: &'a str,
    committed: bool,
}

impl<F: PoolFactory> Reservation<'_, F> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<F: PoolFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.forget(self.key);
        }
    }
}

/// 借出的对象
pub struct Pooled<F: PoolFactory> {
    pool: Arc<KeyedPool<F>>,
    key: String,
    object: Option<F::Object>,
}

impl<F: PoolFactory> Pooled<F> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 归还到池里
    pub fn release(mut self) {
        if let Some(object) = self.object.take() {
            self.pool.release(&self.key, object);
        }
    }

    /// 销毁，不再复用
    pub fn discard(mut self) {
        if let Some(object) = self.object.take() {
            self.pool.destroy(&self.key, object);
        }
    }
}

impl<F: PoolFactory> Deref for Pooled<F> {
    type Target = F::Object;

    fn deref(&self) -> &Self::Target {
        self.object.as_ref().expect("pooled object is present until consumed")
    }
}

impl<F: PoolFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("pooled object is present until consumed")
    }
}

impl<F: PoolFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.destroy(&self.key, object);
        }
    }
}
