use parking_lot::RwLock;
use rand::seq::{IndexedRandom, SliceRandom};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wrpc_core::{LoadBalanceStrategy, Result, ServerNode, WrpcErr};

/// 负载均衡
///
/// `set_nodes` 整体替换选择列表，读者要么看到旧列表，要么看到新列表。
pub trait LoadBalance: Send + Sync + 'static {
    fn set_nodes(&self, nodes: &[ServerNode]);

    /// 没有可用节点时返回 `NoServerAvailable`
    fn get_node(&self) -> Result<ServerNode>;
}

/// 按权重展开并打乱
fn expand(nodes: &[ServerNode]) -> Vec<ServerNode> {
    let mut list: Vec<ServerNode> = nodes
        .iter()
        .flat_map(|node| std::iter::repeat_n(node.clone(), node.weight().max(1) as usize))
        .collect();
    list.shuffle(&mut rand::rng());
    list
}

/// 一次构建出来的选择列表和它自己的游标
#[derive(Default)]
struct Selection {
    nodes: Vec<ServerNode>,
    cursor: AtomicUsize,
}

/// 加权轮询
#[derive(Default)]
pub struct RoundRobinLoad {
    current: RwLock<Arc<Selection>>,
}

impl RoundRobinLoad {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RoundRobinLoad {
    fn set_nodes(&self, nodes: &[ServerNode]) {
        let selection = Arc::new(Selection {
            nodes: expand(nodes),
            cursor: AtomicUsize::new(0),
        });
        *self.current.write() = selection;
    }

    fn get_node(&self) -> Result<ServerNode> {
        let selection = self.current.read().clone();
        let len = selection.nodes.len();
        if len == 0 {
            return Err(WrpcErr::NoServerAvailable);
        }

        let index = selection
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
            .unwrap_or(0);
        Ok(selection.nodes[index % len].clone())
    }
}

/// 加权随机
#[derive(Default)]
pub struct RandomLoad {
    current: RwLock<Arc<Vec<ServerNode>>>,
}

impl RandomLoad {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalance for RandomLoad {
    fn set_nodes(&self, nodes: &[ServerNode]) {
        *self.current.write() = Arc::new(expand(nodes));
    }

    fn get_node(&self) -> Result<ServerNode> {
        let nodes = self.current.read().clone();
        nodes
            .choose(&mut rand::rng())
            .cloned()
            .ok_or(WrpcErr::NoServerAvailable)
    }
}

/// 根据策略创建负载均衡器
pub fn new_load_balance(strategy: LoadBalanceStrategy) -> Arc<dyn LoadBalance> {
    match strategy {
        LoadBalanceStrategy::RoundRobin => Arc::new(RoundRobinLoad::new()),
        LoadBalanceStrategy::Random => Arc::new(RandomLoad::new()),
    }
}
