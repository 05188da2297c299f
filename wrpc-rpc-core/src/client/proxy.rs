use super::factory::ConnectionFactory;
use crate::pool::KeyedPool;
use crate::service::ServiceDescriptor;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;
use wrpc_core::{Result, RetryPolicy, WrpcErr};

/// 单次尝试的结果
enum Attempt {
    Done(Value),
    /// 消耗一次重试
    Retry(WrpcErr),
    /// 直接返回给调用方
    Fatal(WrpcErr),
}

/// 一个服务的调用代理
///
/// 每次调用：借连接 → 调用 → 成功归还、失败销毁 → 休眠后重试，
/// 全部失败后返回 `CallFailed`。
#[derive(Clone)]
pub struct CallProxy {
    service: ServiceDescriptor,
    pool: Arc<KeyedPool<ConnectionFactory>>,
    policy: RetryPolicy,
}

impl CallProxy {
    pub fn new(
        service: ServiceDescriptor,
        pool: Arc<KeyedPool<ConnectionFactory>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            pool,
            policy,
        }
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn call(&self, method: &str, args: Value) -> Result<Value> {
        let name = self.service.name();
        let attempts = self.policy.retry.max(1);
        let deadline = self.policy.call_timeout.map(|timeout| Instant::now() + timeout);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let outcome = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.attempt(method, args.clone())).await {
                        Ok(outcome) => outcome,
                        Err(_) => return Err(self.timed_out(method)),
                    }
                }
                None => self.attempt(method, args.clone()).await,
            };

            match outcome {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retry(e) => {
                    log::warn!(
                        "Call {}.{} failed on attempt {}/{}: {}",
                        name,
                        method,
                        attempt,
                        attempts,
                        e
                    );
                    last_err = Some(e);
                }
            }

            match deadline {
                Some(deadline) if Instant::now() + self.policy.retry_interval >= deadline => {
                    tokio::time::sleep_until(deadline).await;
                    return Err(self.timed_out(method));
                }
                _ => tokio::time::sleep(self.policy.retry_interval).await,
            }
        }

        let source = last_err.unwrap_or(WrpcErr::NoServerAvailable);
        log::error!("Call {}.{} failed after {} attempts: {}", name, method, attempts, source);
        Err(WrpcErr::CallFailed {
            attempts,
            source: Box::new(source),
        })
    }

    /// 调用并把结果反序列化成 `T`
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Value) -> Result<T> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn attempt(&self, method: &str, args: Value) -> Attempt {
        let mut conn = match self.pool.get(self.service.name()).await {
            Ok(conn) => conn,
            Err(e) if e.is_retryable() => return Attempt::Retry(e),
            Err(e) => return Attempt::Fatal(e),
        };

        if !conn.has_method(method) {
            conn.release();
            return Attempt::Fatal(WrpcErr::unknown_method(self.service.name(), method));
        }

        match conn.invoke(method, args).await {
            Ok(value) => {
                conn.release();
                Attempt::Done(value)
            }
            Err(e @ WrpcErr::UnknownMethod { .. }) => {
                conn.release();
                Attempt::Fatal(e)
            }
            Err(e @ WrpcErr::RemoteError(_)) if !self.policy.retry_on_remote_error => {
                conn.release();
                Attempt::Fatal(e)
            }
            Err(e) => {
                log::debug!(
                    "Destroy connection to {} after error: {}",
                    conn.node().host_port(),
                    e
                );
                conn.discard();
                if e.is_retryable() {
                    Attempt::Retry(e)
                } else {
                    Attempt::Fatal(e)
                }
            }
        }
    }

    fn timed_out(&self, method: &str) -> WrpcErr {
        WrpcErr::timeout(format!(
            "call {}.{} exceeded {:?}",
            self.service.name(),
            method,
            self.policy.call_timeout.unwrap_or_default()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::MockTransport;
    use crate::discover::{FixedProvider, Provider};
    use serde_json::json;
    use std::time::Duration;
    use wrpc_core::{LoadBalanceStrategy, PoolConfig};

    fn proxy(
        transport: Arc<MockTransport>,
        service: ServiceDescriptor,
        policy: RetryPolicy,
    ) -> CallProxy {
        let provider: Arc<dyn Provider> = Arc::new(
            FixedProvider::new("127.0.0.1:8603", vec![service.clone()], LoadBalanceStrategy::RoundRobin)
                .unwrap(),
        );
        let factory = ConnectionFactory::new(provider, transport).unwrap();
        let pool = Arc::new(KeyedPool::new(factory, PoolConfig::default()));
        CallProxy::new(service, pool, policy)
    }

    fn policy(retry: u32, interval: Duration) -> RetryPolicy {
        RetryPolicy {
            retry,
            retry_interval: interval,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_returns_connection() {
        let transport = Arc::new(MockTransport::default());
        let proxy = proxy(transport.clone(), ServiceDescriptor::open("Echo"), policy(3, Duration::from_millis(10)));

        let value = proxy.call("echo", json!(["hi"])).await.unwrap();
        assert_eq!(value, json!({"method": "echo", "args": ["hi"]}));
        proxy.call("echo", json!([])).await.unwrap();

        assert_eq!(transport.opens(), 1);
        assert_eq!(proxy.pool.idle_count("Echo"), 1);
        assert_eq!(proxy.pool.outstanding_count("Echo"), 1);
    }

    #[tokio::test]
    async fn test_factory_failures_are_retried() {
        let transport = Arc::new(MockTransport::failing_opens(2));
        let proxy = proxy(transport.clone(), ServiceDescriptor::open("Echo"), policy(3, Duration::from_millis(10)));

        let value = proxy.call("echo", json!(1)).await.unwrap();
        assert_eq!(value["args"], json!(1));
        assert_eq!(transport.opens(), 3);
        // 失败的创建不占名额，借出的连接已归还
        assert_eq!(proxy.pool.outstanding_count("Echo"), 1);
        assert_eq!(proxy.pool.idle_count("Echo"), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_replaced() {
        let transport = Arc::new(MockTransport::default());
        let proxy = proxy(transport.clone(), ServiceDescriptor::open("Echo"), policy(3, Duration::from_millis(10)));
        proxy.call("echo", json!(0)).await.unwrap();
        let before = proxy.pool.outstanding_count("Echo");

        transport.fail_invokes(1);
        transport.fail_opens(1);
        proxy.call("echo", json!(1)).await.unwrap();

        assert_eq!(proxy.pool.outstanding_count("Echo"), before);
        assert_eq!(transport.opens(), 3);
    }

    #[tokio::test]
    async fn test_closed_idle_connection_is_not_reused() {
        let transport = Arc::new(MockTransport::default());
        let proxy = proxy(transport.clone(), ServiceDescriptor::open("Echo"), policy(1, Duration::from_millis(10)));
        proxy.call("echo", json!(0)).await.unwrap();

        let mut conn = proxy.pool.borrow("Echo").await.unwrap();
        conn.close();
        proxy.pool.release("Echo", conn);

        let value = proxy.call("echo", json!(1)).await.unwrap();
        assert_eq!(value["args"], json!(1));
        assert_eq!(transport.opens(), 2);
        assert_eq!(transport.invokes(), 2);
        assert_eq!(proxy.pool.outstanding_count("Echo"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_wrap_last_error() {
        let transport = Arc::new(MockTransport::failing_opens(10));
        let proxy = proxy(transport.clone(), ServiceDescriptor::open("Echo"), policy(3, Duration::from_millis(5)));

        match proxy.call("echo", json!(1)).await {
            Err(WrpcErr::CallFailed { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, WrpcErr::ConnectionError(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(transport.opens(), 3);
        assert_eq!(proxy.pool.outstanding_count("Echo"), 0);
    }

    #[tokio::test]
    async fn test_unknown_method_fails_fast() {
        let transport = Arc::new(MockTransport::default());
        let service = ServiceDescriptor::new("Echo", ["echo"]);
        let proxy = proxy(transport.clone(), service, policy(3, Duration::from_secs(5)));

        let started = std::time::Instant::now();
        let res = proxy.call("nope", json!(1)).await;
        assert!(matches!(res, Err(WrpcErr::UnknownMethod { ref method, .. }) if method == "nope"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.invokes(), 0);
        assert_eq!(proxy.pool.idle_count("Echo"), 1);
    }

    #[tokio::test]
    async fn test_remote_error_policy() {
        let transport = Arc::new(MockTransport::default());
        let proxy_retrying = proxy(transport.clone(), ServiceDescriptor::open("Echo"), policy(2, Duration::from_millis(5)));
        transport.remote_errors(2);
        assert!(matches!(
            proxy_retrying.call("echo", json!(1)).await,
            Err(WrpcErr::CallFailed { attempts: 2, .. })
        ));
        assert_eq!(transport.opens(), 2);

        let transport = Arc::new(MockTransport::default());
        let strict = proxy(
            transport.clone(),
            ServiceDescriptor::open("Echo"),
            RetryPolicy {
                retry_on_remote_error: false,
                ..policy(3, Duration::from_millis(5))
            },
        );
        transport.remote_errors(1);
        assert!(matches!(
            strict.call("echo", json!(1)).await,
            Err(WrpcErr::RemoteError(_))
        ));
        assert_eq!(transport.invokes(), 1);
        assert_eq!(strict.pool.idle_count("Echo"), 1);
    }

    #[tokio::test]
    async fn test_call_timeout_cuts_retries_short() {
        let transport = Arc::new(MockTransport::failing_opens(10));
        let proxy = proxy(
            transport,
            ServiceDescriptor::open("Echo"),
            RetryPolicy {
                call_timeout: Some(Duration::from_millis(50)),
                ..policy(10, Duration::from_millis(200))
            },
        );

        let started = std::time::Instant::now();
        assert!(matches!(proxy.call("echo", json!(1)).await, Err(WrpcErr::Timeout(_))));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_call_as_deserializes() {
        #[derive(serde::Deserialize)]
        struct Echoed {
            method: String,
        }

        let transport = Arc::new(MockTransport::default());
        let proxy = proxy(transport, ServiceDescriptor::open("Echo"), policy(1, Duration::from_millis(5)));
        let echoed: Echoed = proxy.call_as("ping", json!(null)).await.unwrap();
        assert_eq!(echoed.method, "ping");
    }
}
