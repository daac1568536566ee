//! Static description of a cluster: how many nodes, which of them produce,
//! how they peer and which extra flags each one receives.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};

/// Number of distinct producer account names available (`defproducera` ..= `defproducerz`).
pub const MAX_PRODUCER_ACCOUNTS: usize = 26;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerShape {
    /// Every node peers with every other node.
    Mesh,
    /// Every node peers with node 0 only.
    Star,
    /// Node `i` peers with node `i - 1`.
    Line,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Producer,
    IrreversibleReader,
    Relay,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeRole::Producer => "producer",
            NodeRole::IrreversibleReader => "irreversible-reader",
            NodeRole::Relay => "relay",
        };
        f.write_str(label)
    }
}

/// Configuration snapshot fixed at launch time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub producer_nodes: usize,
    pub total_nodes: usize,
    pub producers_per_node: usize,
    pub shape: PeerShape,
    pub extra_args: BTreeMap<usize, Vec<String>>,
    pub common_args: Vec<String>,
}

impl ClusterTopology {
    pub fn new(producer_nodes: usize, total_nodes: usize) -> Self {
        Self {
            producer_nodes,
            total_nodes,
            producers_per_node: 1,
            shape: PeerShape::Mesh,
            extra_args: BTreeMap::new(),
            common_args: Vec::new(),
        }
    }

    pub fn with_shape(mut self, shape: PeerShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_node_args<I, S>(mut self, node_id: usize, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args
            .entry(node_id)
            .or_default()
            .extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends flags passed to every node, ahead of the per-node extras.
    pub fn with_common_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.common_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.total_nodes == 0 {
            return Err(HarnessError::Config("topology needs at least one node".to_string()));
        }
        if self.producer_nodes == 0 {
            return Err(HarnessError::Config(
                "topology needs at least one producer node".to_string(),
            ));
        }
        if self.producer_nodes > self.total_nodes {
            return Err(HarnessError::Config(format!(
                "{} producer nodes exceed {} total nodes",
                self.producer_nodes, self.total_nodes
            )));
        }
        if self.producers_per_node == 0 {
            return Err(HarnessError::Config(
                "producers_per_node must be at least one".to_string(),
            ));
        }
        if self.producer_count() > MAX_PRODUCER_ACCOUNTS {
            return Err(HarnessError::Config(format!(
                "{} producers requested, at most {MAX_PRODUCER_ACCOUNTS} are supported",
                self.producer_count()
            )));
        }
        if let Some(node_id) = self.extra_args.keys().find(|id| **id >= self.total_nodes) {
            return Err(HarnessError::Config(format!(
                "extra arguments given for node {node_id} outside a {}-node cluster",
                self.total_nodes
            )));
        }
        Ok(())
    }

    pub fn producer_count(&self) -> usize {
        self.producer_nodes * self.producers_per_node
    }

    /// Producer account names hosted by `node_id`; empty for non-producing nodes.
    pub fn producers_for(&self, node_id: usize) -> Vec<String> {
        if node_id >= self.producer_nodes {
            return Vec::new();
        }
        let first = node_id * self.producers_per_node;
        (first..first + self.producers_per_node)
            .map(producer_name)
            .collect()
    }

    pub fn all_producers(&self) -> Vec<String> {
        (0..self.producer_count()).map(producer_name).collect()
    }

    pub fn role(&self, node_id: usize) -> NodeRole {
        if node_id < self.producer_nodes {
            NodeRole::Producer
        } else if self.args_for(node_id).windows(2).any(|pair| {
            pair[0] == "--read-mode" && pair[1] == "irreversible"
        }) {
            NodeRole::IrreversibleReader
        } else {
            NodeRole::Relay
        }
    }

    /// Extra arguments for `node_id`: the shared ones followed by the node specific ones.
    pub fn args_for(&self, node_id: usize) -> Vec<String> {
        let mut args = self.common_args.clone();
        if let Some(extra) = self.extra_args.get(&node_id) {
            args.extend(extra.iter().cloned());
        }
        args
    }

    /// Node ids `node_id` dials on startup.
    pub fn peers_of(&self, node_id: usize) -> Vec<usize> {
        match self.shape {
            PeerShape::Mesh => (0..self.total_nodes).filter(|id| *id != node_id).collect(),
            PeerShape::Star if node_id == 0 => (1..self.total_nodes).collect(),
            PeerShape::Star => vec![0],
            PeerShape::Line => {
                let mut peers = Vec::new();
                if node_id > 0 {
                    peers.push(node_id - 1);
                }
                if node_id + 1 < self.total_nodes {
                    peers.push(node_id + 1);
                }
                peers
            }
        }
    }
}

/// `defproducera`, `defproducerb`, ...
pub fn producer_name(index: usize) -> String {
    let suffix = (b'a' + (index % MAX_PRODUCER_ACCOUNTS) as u8) as char;
    format!("defproducer{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producers_are_spread_over_producer_nodes() {
        let mut topology = ClusterTopology::new(2, 4);
        topology.producers_per_node = 2;
        assert_eq!(topology.producers_for(0), vec!["defproducera", "defproducerb"]);
        assert_eq!(topology.producers_for(1), vec!["defproducerc", "defproducerd"]);
        assert!(topology.producers_for(3).is_empty());
        assert_eq!(topology.all_producers().len(), 4);
    }

    #[test]
    fn roles_follow_position_and_read_mode() {
        let topology = ClusterTopology::new(1, 3).with_node_args(1, ["--read-mode", "irreversible"]);
        assert_eq!(topology.role(0), NodeRole::Producer);
        assert_eq!(topology.role(1), NodeRole::IrreversibleReader);
        assert_eq!(topology.role(2), NodeRole::Relay);
    }

    #[test]
    fn peer_shapes() {
        let mesh = ClusterTopology::new(1, 4);
        assert_eq!(mesh.peers_of(2), vec![0, 1, 3]);

        let star = ClusterTopology::new(1, 4).with_shape(PeerShape::Star);
        assert_eq!(star.peers_of(0), vec![1, 2, 3]);
        assert_eq!(star.peers_of(3), vec![0]);

        let line = ClusterTopology::new(1, 4).with_shape(PeerShape::Line);
        assert_eq!(line.peers_of(0), vec![1]);
        assert_eq!(line.peers_of(2), vec![1, 3]);
    }

    #[test]
    fn invalid_topologies_are_rejected() {
        assert!(ClusterTopology::new(0, 2).validate().is_err());
        assert!(ClusterTopology::new(3, 2).validate().is_err());
        assert!(ClusterTopology::new(1, 2).with_node_args(5, ["--x"]).validate().is_err());
        assert!(ClusterTopology::new(2, 2).validate().is_ok());
    }
}
