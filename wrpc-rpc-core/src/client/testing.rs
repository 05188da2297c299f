use crate::transport::{Channel, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wrpc_core::{Result, WrpcErr};

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    invokes: AtomicUsize,
    fail_opens: AtomicUsize,
    fail_invokes: AtomicUsize,
    remote_errors: AtomicUsize,
}

/// 回显参数的传输，可以按次数注入失败
#[derive(Default)]
pub struct MockTransport {
    counters: Arc<Counters>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockTransport {
    pub fn failing_opens(n: usize) -> Self {
        let transport = Self::default();
        transport.fail_opens(n);
        transport
    }

    pub fn fail_opens(&self, n: usize) {
        self.counters.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_invokes(&self, n: usize) {
        self.counters.fail_invokes.store(n, Ordering::SeqCst);
    }

    pub fn remote_errors(&self, n: usize) {
        self.counters.remote_errors.store(n, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn invokes(&self) -> usize {
        self.counters.invokes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, host: &str, port: u16) -> Result<Box<dyn Channel>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.counters.fail_opens) {
            return Err(WrpcErr::connection_error(format!("{}:{} refused", host, port)));
        }
        Ok(Box::new(MockChannel {
            counters: self.counters.clone(),
            open: true,
        }))
    }
}

struct MockChannel {
    counters: Arc<Counters>,
    open: bool,
}

#[async_trait]
impl Channel for MockChannel {
    async fn invoke(&mut self, _service: &str, method: &str, args: Value) -> Result<Value> {
        self.counters.invokes.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.counters.fail_invokes) {
            self.open = false;
            return Err(WrpcErr::transport_error("broken pipe"));
        }
        if take_one(&self.counters.remote_errors) {
            return Err(WrpcErr::remote_error("bad input"));
        }
        Ok(json!({ "method": method, "args": args }))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
