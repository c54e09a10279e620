//! Tree node blocks.
//!
//! A leaf holds the entries themselves; a branch holds the first key of each
//! child next to its link. Both encode as dag-cbor maps of the shape
//! `{ "level": int, "entries": [[key, value-or-link], ...] }`.

use cid::Cid;
use libipld::Ipld;

use crate::codec;
use crate::error::{Error, Result};
use crate::store::Block;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Ipld,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BranchEntry {
    pub key: Vec<u8>,
    pub link: Cid,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Leaf(Vec<LeafEntry>),
    Branch { level: u64, entries: Vec<BranchEntry> },
}

impl Node {
    pub fn encode(&self) -> Result<Block> {
        let (level, entries): (u64, Vec<Ipld>) = match self {
            Node::Leaf(entries) => (
                0,
                entries
                    .iter()
                    .map(|e| Ipld::List(vec![Ipld::Bytes(e.key.clone()), e.value.clone()]))
                    .collect(),
            ),
            Node::Branch { level, entries } => (
                *level,
                entries
                    .iter()
                    .map(|e| Ipld::List(vec![Ipld::Bytes(e.key.clone()), Ipld::Link(e.link)]))
                    .collect(),
            ),
        };
        let ipld = Ipld::Map(std::collections::BTreeMap::from([
            ("level".to_string(), Ipld::Integer(level as i128)),
            ("entries".to_string(), Ipld::List(entries)),
        ]));
        let (cid, bytes) = codec::encode(&ipld)?;
        Ok(Block::new(cid, bytes))
    }

    pub fn decode(cid: &Cid, bytes: &[u8]) -> Result<Node> {
        let ipld = codec::decode(cid, bytes)?;
        Self::from_ipld(ipld).ok_or_else(|| Error::Decode {
            cid: *cid,
            reason: "malformed tree node".to_string(),
        })
    }

    fn from_ipld(ipld: Ipld) -> Option<Node> {
        let Ipld::Map(mut map) = ipld else {
            return None;
        };
        let Ipld::Integer(level) = map.remove("level")? else {
            return None;
        };
        if !(0..=u64::MAX as i128).contains(&level) {
            return None;
        }
        let Ipld::List(raw) = map.remove("entries")? else {
            return None;
        };
        if level == 0 {
            let mut entries = Vec::with_capacity(raw.len());
            for item in raw {
                let Ipld::List(mut pair) = item else {
                    return None;
                };
                if pair.len() != 2 {
                    return None;
                }
                let value = pair.pop()?;
                let Ipld::Bytes(key) = pair.pop()? else {
                    return None;
                };
                entries.push(LeafEntry { key, value });
            }
            Some(Node::Leaf(entries))
        } else {
            let mut entries = Vec::with_capacity(raw.len());
            for item in raw {
                let Ipld::List(mut pair) = item else {
                    return None;
                };
                if pair.len() != 2 {
                    return None;
                }
                let Ipld::Link(link) = pair.pop()? else {
                    return None;
                };
                let Ipld::Bytes(key) = pair.pop()? else {
                    return None;
                };
                entries.push(BranchEntry { key, link });
            }
            Some(Node::Branch {
                level: level as u64,
                entries,
            })
        }
    }

    /// The first key covered by this node. Empty nodes only occur as the
    /// root of an empty tree.
    pub fn first_key(&self) -> Option<&[u8]> {
        match self {
            Node::Leaf(entries) => entries.first().map(|e| e.key.as_slice()),
            Node::Branch { entries, .. } => entries.first().map(|e| e.key.as_slice()),
        }
    }
}
