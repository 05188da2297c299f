use super::{join_path, parent_of, ChildrenListener, Coordinator, SessionListener, SessionState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use wrpc_core::config::namespace_root;
use wrpc_core::{Result, WrpcErr};

/// 进程内的注册中心
///
/// 一个 ensemble 是一棵共享的节点树，`connect` 打开一个客户端会话。
/// 临时节点归属于会话，会话过期或客户端关闭时自动删除。
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

#[derive(Default)]
struct EnsembleInner {
    tree: Mutex<Tree>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Tree {
    /// 路径 -> 临时节点所属会话
    nodes: BTreeMap<String, Option<u64>>,
    watches: Vec<Watch>,
    clients: HashMap<u64, ClientEntry>,
}

struct Watch {
    path: String,
    client_id: u64,
    tx: UnboundedSender<Vec<String>>,
}

struct ClientEntry {
    session_id: u64,
    closed: bool,
    session_tx: Option<UnboundedSender<SessionState>>,
}

impl Tree {
    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn notify(&mut self, path: &str) {
        let children = self.children(path);
        self.watches.retain(|w| {
            if w.path != path {
                return true;
            }
            w.tx.send(children.clone()).is_ok()
        });
    }

    fn notify_parent(&mut self, path: &str) {
        if let Some(parent) = parent_of(path) {
            let parent = parent.to_string();
            self.notify(&parent);
        }
    }

    fn send_state(&mut self, client_id: u64, state: SessionState) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            if let Some(tx) = &client.session_tx {
                if tx.send(state).is_err() {
                    client.session_tx = None;
                }
            }
        }
    }

    /// 删除会话持有的全部临时节点
    fn drop_ephemerals(&mut self, session_id: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, owner)| **owner == Some(session_id))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            log::debug!("Ephemeral node removed with session {}: {}", session_id, path);
            self.notify_parent(&path);
        }
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开一个客户端，根路径为 `/wrpc` 或 `/wrpc/{namespace}`
    pub fn connect(&self, namespace: &str) -> MemoryCoordinator {
        let client_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.tree.lock().clients.insert(
            client_id,
            ClientEntry {
                session_id,
                closed: false,
                session_tx: None,
            },
        );
        log::info!("Memory coordinator client {} connected with session {}", client_id, session_id);

        MemoryCoordinator {
            ensemble: self.inner.clone(),
            client_id,
            root: namespace_root(namespace),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 模拟会话过期：删除临时节点，通知 `Lost`，随后以新会话重连并通知 `Connected`
    pub fn expire_session(&self, client_id: u64) {
        let mut tree = self.inner.tree.lock();
        let Some(old_session) = tree
            .clients
            .get(&client_id)
            .filter(|c| !c.closed)
            .map(|c| c.session_id)
        else {
            return;
        };

        tree.drop_ephemerals(old_session);
        tree.send_state(client_id, SessionState::Lost);

        let new_session = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(client) = tree.clients.get_mut(&client_id) {
            client.session_id = new_session;
        }
        log::info!(
            "Memory coordinator client {} session {} expired, reconnected with {}",
            client_id,
            old_session,
            new_session
        );
        tree.send_state(client_id, SessionState::Connected);
    }

    /// 模拟连接挂起
    pub fn suspend(&self, client_id: u64) {
        self.inner.tree.lock().send_state(client_id, SessionState::Suspended);
    }

    /// 按绝对路径列出子节点
    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner.tree.lock().children(path)
    }

    /// 按绝对路径判断节点是否存在
    pub fn contains(&self, path: &str) -> bool {
        self.inner.tree.lock().nodes.contains_key(path)
    }
}

/// 一个 `MemoryEnsemble` 客户端
#[derive(Clone)]
pub struct MemoryCoordinator {
    ensemble: Arc<EnsembleInner>,
    client_id: u64,
    root: String,
    listeners: Arc<Mutex<Vec<Arc<dyn SessionListener>>>>,
}

impl MemoryCoordinator {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn session_id(&self) -> Option<u64> {
        self.ensemble
            .tree
            .lock()
            .clients
            .get(&self.client_id)
            .map(|c| c.session_id)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn full_path(&self, path: &str) -> String {
        join_path(&self.root, path)
    }

    fn live_session(&self, tree: &Tree) -> Result<u64> {
        match tree.clients.get(&self.client_id) {
            Some(client) if !client.closed => Ok(client.session_id),
            _ => Err(WrpcErr::coordination_error("client is closed")),
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn ensure_path(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        let mut tree = self.ensemble.tree.lock();
        self.live_session(&tree)?;

        let mut current = String::new();
        for segment in full.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !tree.nodes.contains_key(&current) {
                tree.nodes.insert(current.clone(), None);
                tree.notify_parent(&current);
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.full_path(path);
        let tree = self.ensemble.tree.lock();
        self.live_session(&tree)?;
        Ok(tree.nodes.contains_key(&full))
    }

    async fn create(&self, path: &str, ephemeral: bool) -> Result<()> {
        let full = self.full_path(path);
        let mut tree = self.ensemble.tree.lock();
        let session_id = self.live_session(&tree)?;

        if tree.nodes.contains_key(&full) {
            return Err(WrpcErr::NodeExists(full));
        }
        if let Some(parent) = parent_of(&full) {
            if parent != "/" && !tree.nodes.contains_key(parent) {
                return Err(WrpcErr::NoNode(parent.to_string()));
            }
        }

        let owner = ephemeral.then_some(session_id);
        tree.nodes.insert(full.clone(), owner);
        tree.notify_parent(&full);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        let mut tree = self.ensemble.tree.lock();
        self.live_session(&tree)?;

        if !tree.nodes.contains_key(&full) {
            return Err(WrpcErr::NoNode(full));
        }
        if !tree.children(&full).is_empty() {
            return Err(WrpcErr::coordination_error(format!("node not empty: {}", full)));
        }
        tree.nodes.remove(&full);
        tree.notify_parent(&full);
        Ok(())
    }

    async fn children_watch(&self, path: &str, listener: Arc<dyn ChildrenListener>) -> Result<()> {
        let full = self.full_path(path);
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();

        {
            let mut tree = self.ensemble.tree.lock();
            self.live_session(&tree)?;
            let initial = tree.children(&full);
            // 先投递当前子节点，再登记监听，保证首个回调就是完整快照
            let _ = tx.send(initial);
            tree.watches.push(Watch {
                path: full.clone(),
                client_id: self.client_id,
                tx,
            });
        }

        tokio::spawn(async move {
            while let Some(children) = rx.recv().await {
                listener.on_children(children).await;
            }
            log::debug!("Children watch on {} stopped", full);
        });
        Ok(())
    }

    async fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().push(listener);

        let mut tree = self.ensemble.tree.lock();
        let Some(client) = tree.clients.get_mut(&self.client_id) else {
            return;
        };
        if client.closed || client.session_tx.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<SessionState>();
        client.session_tx = Some(tx);

        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            while let Some(state) = rx.recv().await {
                let current: Vec<Arc<dyn SessionListener>> = listeners.lock().clone();
                for listener in current {
                    listener.on_state(state).await;
                }
            }
        });
    }

    async fn close(&self) {
        let mut tree = self.ensemble.tree.lock();
        let session_id = match tree.clients.get_mut(&self.client_id) {
            Some(client) if !client.closed => {
                client.closed = true;
                client.session_tx = None;
                client.session_id
            }
            _ => return,
        };

        tree.drop_ephemerals(session_id);
        let client_id = self.client_id;
        tree.watches.retain(|w| w.client_id != client_id);
        log::info!("Memory coordinator client {} closed", client_id);
    }
}
