use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    addr: SocketAddr,
    strikes: u32,
    /// Chain height the peer last announced
    height: u64,
}

impl Node {
    fn new(addr: SocketAddr) -> Node {
        Node {
            addr,
            strikes: 0,
            height: 0,
        }
    }

    pub fn get_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn get_strikes(&self) -> u32 {
        self.strikes
    }

    pub fn get_height(&self) -> u64 {
        self.height
    }
}

/// The active peer set
///
/// A peer whose blocks keep failing validation collects strikes and is evicted at
/// `max_strikes`. Eviction is not a ban: a later Hello puts it back with a clean record.
pub struct Nodes {
    inner: RwLock<HashMap<SocketAddr, Node>>,
    max_strikes: u32,
}

impl Nodes {
    pub fn new(max_strikes: u32) -> Nodes {
        Nodes {
            inner: RwLock::new(HashMap::new()),
            max_strikes,
        }
    }

    /// Returns true if `addr` was not already known.
    pub fn add_node(&self, addr: SocketAddr) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.contains_key(&addr) {
            return false;
        }
        inner.insert(addr, Node::new(addr));
        true
    }

    pub fn evict_node(&self, addr: &SocketAddr) -> Option<Node> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(addr)
    }

    pub fn record_height(&self, addr: &SocketAddr, height: u64) {
        if let Some(node) = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(addr)
        {
            node.height = height;
        }
    }

    /// Count one misbehavior against `addr`. Returns true if that evicted it.
    pub fn strike(&self, addr: &SocketAddr) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(node) = inner.get_mut(addr) else {
            return false;
        };
        node.strikes += 1;
        if node.strikes >= self.max_strikes {
            inner.remove(addr);
            return true;
        }
        false
    }

    pub fn get_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        nodes.sort_by_key(|node| node.addr);
        nodes
    }

    /// Up to `limit` peer addresses, fewest strikes first, never including `exclude`.
    pub fn best_addresses(&self, limit: usize, exclude: &SocketAddr) -> Vec<SocketAddr> {
        let mut nodes = self.get_nodes();
        nodes.retain(|node| node.addr != *exclude);
        nodes.sort_by_key(|node| (node.strikes, node.addr));
        nodes.into_iter().take(limit).map(|node| node.addr).collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_is_known(&self, addr: &SocketAddr) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_is_idempotent() {
        let nodes = Nodes::new(3);
        assert!(nodes.add_node(addr(2001)));
        assert!(!nodes.add_node(addr(2001)));
        assert_eq!(nodes.len(), 1);
        assert!(nodes.node_is_known(&addr(2001)));
    }

    #[test]
    fn test_strikes_evict_then_hello_readmits() {
        let nodes = Nodes::new(2);
        nodes.add_node(addr(2001));
        assert!(!nodes.strike(&addr(2001)));
        assert!(nodes.strike(&addr(2001)));
        assert!(!nodes.node_is_known(&addr(2001)));
        // Unknown peers cannot be struck
        assert!(!nodes.strike(&addr(2001)));

        assert!(nodes.add_node(addr(2001)));
        assert_eq!(nodes.get_nodes()[0].get_strikes(), 0);
    }

    #[test]
    fn test_best_addresses_prefers_fewest_strikes() {
        let nodes = Nodes::new(5);
        for port in [2001, 2002, 2003] {
            nodes.add_node(addr(port));
        }
        nodes.strike(&addr(2001));
        nodes.strike(&addr(2001));
        nodes.strike(&addr(2002));

        assert_eq!(
            nodes.best_addresses(10, &addr(9999)),
            vec![addr(2003), addr(2002), addr(2001)]
        );
        assert_eq!(nodes.best_addresses(1, &addr(2003)), vec![addr(2002)]);
    }

    #[test]
    fn test_record_height() {
        let nodes = Nodes::new(3);
        nodes.add_node(addr(2001));
        nodes.record_height(&addr(2001), 42);
        assert_eq!(nodes.get_nodes()[0].get_height(), 42);
    }
}
