use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    user: Option<String>,
    host: String,
}

impl Node {
    /// Parses `[user@]host`. A `default_user` applies only when the entry has
    /// no user of its own.
    pub fn parse(raw: &str, default_user: Option<&str>) -> Result<Self> {
        let raw = raw.trim();
        let (user, host) = match raw.rsplit_once('@') {
            Some((user, host)) => (Some(user.trim().to_string()), host.trim()),
            None => (default_user.map(|u| u.to_string()), raw),
        };
        if host.is_empty() {
            return Err(anyhow!("invalid node entry '{}': empty host", raw));
        }
        if user.as_deref() == Some("") {
            return Err(anyhow!("invalid node entry '{}': empty user", raw));
        }
        Ok(Self {
            user,
            host: host.to_string(),
        })
    }

    /// Sanitized identifier used in volume names.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn address(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Ordered, duplicate-free list of hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet(Vec<Node>);

impl NodeSet {
    pub fn new(nodes: Vec<Node>) -> Self {
        let mut set = NodeSet::default();
        for node in nodes {
            set.push(node);
        }
        set
    }

    pub fn parse<S: AsRef<str>>(entries: &[S], default_user: Option<&str>) -> Result<Self> {
        let mut nodes = Vec::new();
        for entry in entries {
            for part in entry.as_ref().split(',') {
                if part.trim().is_empty() {
                    continue;
                }
                nodes.push(Node::parse(part, default_user)?);
            }
        }
        Ok(Self::new(nodes))
    }

    fn push(&mut self, node: Node) {
        if !self.0.iter().any(|n| n.host == node.host) {
            self.0.push(node);
        }
    }

    pub fn union(sets: &[&NodeSet]) -> NodeSet {
        let mut out = NodeSet::default();
        for set in sets {
            for node in set.iter() {
                out.push(node.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.0.iter()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.0.iter().map(|n| n.host.clone()).collect()
    }

    /// Comma-joined `user@host` list as accepted by pdsh `-w`.
    pub fn target_list(&self) -> String {
        self.0
            .iter()
            .map(|n| n.address())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Node lists in the run file may be a single comma-joined string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    One(String),
    Many(Vec<String>),
}

impl Default for NodeSpec {
    fn default() -> Self {
        NodeSpec::Many(Vec::new())
    }
}

impl NodeSpec {
    pub fn resolve(&self, default_user: Option<&str>) -> Result<NodeSet> {
        match self {
            NodeSpec::One(s) => NodeSet::parse(&[s.as_str()], default_user),
            NodeSpec::Many(list) => NodeSet::parse(list, default_user),
        }
    }
}
