//! The merkle clock: a DAG of put/del events encoding causal history.
//!
//! Each event block references its parent events by cid; the head is the set
//! of frontier events with no known descendants. Heads advance and merge
//! commutatively, so replicas that exchange event references converge on the
//! same head regardless of delivery order.

use std::collections::BTreeMap;

use ahash::AHashSet;
use cid::Cid;
use libipld::Ipld;
use tracing::trace;

use crate::codec;
use crate::error::{Error, Result};
use crate::store::{Block, BlockStore};

/// Payload of a single clock event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Put { key: String, value: Ipld },
    Del { key: String },
}

impl EventData {
    pub fn key(&self) -> &str {
        match self {
            EventData::Put { key, .. } => key,
            EventData::Del { key } => key,
        }
    }

    pub fn is_del(&self) -> bool {
        matches!(self, EventData::Del { .. })
    }
}

/// A decoded event block.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub cid: Cid,
    pub parents: Vec<Cid>,
    pub data: EventData,
}

impl Event {
    /// Encode an event and derive its cid. The block is not inserted into
    /// any store.
    pub fn new(parents: Vec<Cid>, data: EventData) -> Result<(Event, Block)> {
        let data_ipld = match &data {
            EventData::Put { key, value } => Ipld::Map(BTreeMap::from([
                ("type".to_string(), Ipld::String("put".to_string())),
                ("key".to_string(), Ipld::String(key.clone())),
                ("value".to_string(), value.clone()),
            ])),
            EventData::Del { key } => Ipld::Map(BTreeMap::from([
                ("type".to_string(), Ipld::String("del".to_string())),
                ("key".to_string(), Ipld::String(key.clone())),
            ])),
        };
        let ipld = Ipld::Map(BTreeMap::from([
            (
                "parents".to_string(),
                Ipld::List(parents.iter().copied().map(Ipld::Link).collect()),
            ),
            ("data".to_string(), data_ipld),
        ]));
        let (cid, bytes) = codec::encode(&ipld)?;
        let event = Event { cid, parents, data };
        Ok((event, Block::new(cid, bytes)))
    }

    pub fn decode(cid: Cid, bytes: &[u8]) -> Result<Event> {
        let ipld = codec::decode(&cid, bytes)?;
        Self::from_ipld(cid, ipld).ok_or_else(|| Error::Decode {
            cid,
            reason: "malformed event block".to_string(),
        })
    }

    fn from_ipld(cid: Cid, ipld: Ipld) -> Option<Event> {
        let Ipld::Map(mut map) = ipld else {
            return None;
        };
        let Ipld::List(parent_links) = map.remove("parents")? else {
            return None;
        };
        let mut parents = Vec::with_capacity(parent_links.len());
        for link in parent_links {
            let Ipld::Link(p) = link else { return None };
            parents.push(p);
        }
        let Ipld::Map(mut data) = map.remove("data")? else {
            return None;
        };
        let Ipld::String(typ) = data.remove("type")? else {
            return None;
        };
        let Ipld::String(key) = data.remove("key")? else {
            return None;
        };
        let data = match typ.as_str() {
            "put" => EventData::Put {
                key,
                value: data.remove("value")?,
            },
            "del" => EventData::Del { key },
            _ => return None,
        };
        Some(Event { cid, parents, data })
    }
}

/// Load and decode a single event, mapping an absent block to
/// [`Error::MissingEvent`].
pub async fn get_event<S: BlockStore>(store: &S, cid: &Cid) -> Result<Event> {
    let block = match store.get(cid).await {
        Ok(block) => block,
        Err(Error::BlockNotFound(c)) => return Err(Error::MissingEvent(c)),
        Err(e) => return Err(e),
    };
    Event::decode(*cid, block.data())
}

/// All events reachable from `tips`, including the tips themselves.
///
/// The visited set doubles as a guard against malformed blocks whose parent
/// links form a loop; hash addressing makes real cycles impossible.
async fn closure<S: BlockStore>(store: &S, tips: &[Cid]) -> Result<AHashSet<Cid>> {
    let mut seen = AHashSet::new();
    let mut stack: Vec<Cid> = tips.to_vec();
    while let Some(cid) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        let event = get_event(store, &cid).await?;
        stack.extend(event.parents);
    }
    Ok(seen)
}

/// Sort a head into its canonical form: deduplicated, ordered by cid bytes.
pub(crate) fn canonical(mut head: Vec<Cid>) -> Vec<Cid> {
    head.sort_by(|a, b| a.to_bytes().cmp(&b.to_bytes()));
    head.dedup();
    head
}

/// Merge a new event into a head.
///
/// The result upholds the head invariant: no member is an ancestor of
/// another. Heads shrink when the new event supersedes existing tips, grow
/// when it is concurrent with them, and stay unchanged when it is already
/// covered.
pub async fn advance<S: BlockStore>(store: &S, head: &[Cid], new: Cid) -> Result<Vec<Cid>> {
    if head.contains(&new) {
        return Ok(head.to_vec());
    }
    let new_event = get_event(store, &new).await?;
    let new_ancestors = closure(store, &new_event.parents).await?;

    let kept: Vec<Cid> = head
        .iter()
        .copied()
        .filter(|h| !new_ancestors.contains(h))
        .collect();
    if kept.len() < head.len() {
        // the new event descends from at least one existing tip
        let mut next = kept;
        next.push(new);
        trace!(%new, tips = next.len(), "advance: superseded tips");
        return Ok(canonical(next));
    }

    let mut head_parents = Vec::new();
    for h in head {
        head_parents.extend(get_event(store, h).await?.parents);
    }
    if closure(store, &head_parents).await?.contains(&new) {
        // already part of known history
        return Ok(head.to_vec());
    }

    let mut next = head.to_vec();
    next.push(new);
    trace!(%new, tips = next.len(), "advance: concurrent tip");
    Ok(canonical(next))
}

/// Events reachable from `head` but not from `since`, as a deterministic
/// linear extension of the causal order: ancestors always precede their
/// descendants, and concurrent events are ordered by cid bytes.
pub async fn since<S: BlockStore>(store: &S, head: &[Cid], since: &[Cid]) -> Result<Vec<Event>> {
    let exclude = closure(store, since).await?;

    let mut events: BTreeMap<Vec<u8>, Event> = BTreeMap::new();
    let mut stack: Vec<Cid> = head
        .iter()
        .copied()
        .filter(|c| !exclude.contains(c))
        .collect();
    let mut seen = AHashSet::new();
    while let Some(cid) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        let event = get_event(store, &cid).await?;
        for p in &event.parents {
            if !exclude.contains(p) {
                stack.push(*p);
            }
        }
        events.insert(cid.to_bytes(), event);
    }

    // Kahn's algorithm, always emitting the ready event with the smallest
    // cid bytes first.
    let mut pending: BTreeMap<Vec<u8>, usize> = BTreeMap::new();
    let mut children: BTreeMap<Vec<u8>, Vec<Vec<u8>>> = BTreeMap::new();
    for (bytes, event) in &events {
        let in_delta = event
            .parents
            .iter()
            .map(|p| p.to_bytes())
            .filter(|b| events.contains_key(b))
            .collect::<Vec<_>>();
        pending.insert(bytes.clone(), in_delta.len());
        for parent in in_delta {
            children.entry(parent).or_default().push(bytes.clone());
        }
    }

    let mut ready: BTreeMap<Vec<u8>, ()> = pending
        .iter()
        .filter(|(_, deps)| **deps == 0)
        .map(|(b, _)| (b.clone(), ()))
        .collect();
    let mut out = Vec::with_capacity(events.len());
    while let Some((bytes, ())) = ready.pop_first() {
        for child in children.remove(&bytes).unwrap_or_default() {
            let deps = pending.get_mut(&child).expect("child tracked");
            *deps -= 1;
            if *deps == 0 {
                ready.insert(child, ());
            }
        }
        out.push(events.remove(&bytes).expect("event tracked"));
    }
    Ok(out)
}

/// Is `a` an ancestor of `b`?
async fn is_ancestor<S: BlockStore>(store: &S, a: &Cid, b: &Cid) -> Result<bool> {
    let parents = get_event(store, b).await?.parents;
    Ok(closure(store, &parents).await?.contains(a))
}

/// The current write to `key` as seen from `head`.
///
/// Among all writes to the key, only the causally-maximal ones compete; ties
/// between concurrent writes resolve to the highest cid bytes. Because the
/// result depends only on the event set, every replica picks the same winner.
pub async fn winner<S: BlockStore>(store: &S, key: &str, head: &[Cid]) -> Result<Option<Event>> {
    let mut candidates: Vec<Event> = Vec::new();
    let mut seen = AHashSet::new();
    let mut stack: Vec<Cid> = head.to_vec();
    while let Some(cid) = stack.pop() {
        if !seen.insert(cid) {
            continue;
        }
        let event = get_event(store, &cid).await?;
        if event.data.key() == key {
            // writes below this one are superseded on this path
            candidates.push(event);
        } else {
            stack.extend(event.parents);
        }
    }
    if candidates.is_empty() {
        return Ok(None);
    }

    let mut maximal: Vec<Event> = Vec::new();
    'outer: for (i, c) in candidates.iter().enumerate() {
        for (j, d) in candidates.iter().enumerate() {
            if i != j && is_ancestor(store, &c.cid, &d.cid).await? {
                continue 'outer;
            }
        }
        maximal.push(c.clone());
    }
    maximal.sort_by(|a, b| a.cid.to_bytes().cmp(&b.cid.to_bytes()));
    Ok(maximal.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn put(key: &str, value: &str) -> EventData {
        EventData::Put {
            key: key.to_string(),
            value: Ipld::String(value.to_string()),
        }
    }

    async fn append(store: &MemStore, parents: Vec<Cid>, data: EventData) -> Event {
        let (event, block) = Event::new(parents, data).unwrap();
        store.put(block).await.unwrap();
        event
    }

    #[tokio::test]
    async fn test_event_roundtrip() {
        let (event, block) = Event::new(vec![], put("k", "v")).unwrap();
        let back = Event::decode(*block.cid(), block.data()).unwrap();
        assert_eq!(event, back);
    }

    #[tokio::test]
    async fn test_advance_linear() {
        let store = MemStore::new();
        let e0 = append(&store, vec![], put("a", "1")).await;
        let head = advance(&store, &[], e0.cid).await.unwrap();
        assert_eq!(head, vec![e0.cid]);

        let e1 = append(&store, head.clone(), put("b", "2")).await;
        let head = advance(&store, &head, e1.cid).await.unwrap();
        assert_eq!(head, vec![e1.cid]);

        // replaying an old event changes nothing
        let head2 = advance(&store, &head, e0.cid).await.unwrap();
        assert_eq!(head2, head);
        // and advance is idempotent
        let head3 = advance(&store, &head, e1.cid).await.unwrap();
        assert_eq!(head3, head);
    }

    #[tokio::test]
    async fn test_advance_concurrent() {
        let store = MemStore::new();
        let base = append(&store, vec![], put("a", "1")).await;
        let left = append(&store, vec![base.cid], put("b", "l")).await;
        let right = append(&store, vec![base.cid], put("b", "r")).await;

        let head = advance(&store, &[base.cid], left.cid).await.unwrap();
        let head = advance(&store, &head, right.cid).await.unwrap();
        assert_eq!(head.len(), 2);
        assert!(head.contains(&left.cid) && head.contains(&right.cid));

        // a merge event covering both tips collapses the head
        let merge = append(&store, head.clone(), put("c", "m")).await;
        let head = advance(&store, &head, merge.cid).await.unwrap();
        assert_eq!(head, vec![merge.cid]);
    }

    #[tokio::test]
    async fn test_advance_order_independent() {
        let store = MemStore::new();
        let a = append(&store, vec![], put("x", "a")).await;
        let b = append(&store, vec![], put("y", "b")).await;
        let c = append(&store, vec![a.cid], put("z", "c")).await;

        let mut h1 = Vec::new();
        for e in [&a, &b, &c] {
            h1 = advance(&store, &h1, e.cid).await.unwrap();
        }
        let mut h2 = Vec::new();
        for e in [&c, &b, &a] {
            h2 = advance(&store, &h2, e.cid).await.unwrap();
        }
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn test_since_orders_ancestors_first() {
        let store = MemStore::new();
        let e0 = append(&store, vec![], put("a", "1")).await;
        let e1 = append(&store, vec![e0.cid], put("b", "2")).await;
        let e2 = append(&store, vec![e1.cid], put("c", "3")).await;

        let delta = since(&store, &[e2.cid], &[]).await.unwrap();
        assert_eq!(
            delta.iter().map(|e| e.cid).collect::<Vec<_>>(),
            vec![e0.cid, e1.cid, e2.cid]
        );

        let delta = since(&store, &[e2.cid], &[e0.cid]).await.unwrap();
        assert_eq!(
            delta.iter().map(|e| e.cid).collect::<Vec<_>>(),
            vec![e1.cid, e2.cid]
        );

        assert!(since(&store, &[e2.cid], &[e2.cid]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_event() {
        let store = MemStore::new();
        let (event, _block) = Event::new(vec![], put("a", "1")).unwrap();
        // block never stored
        match advance(&store, &[], event.cid).await {
            Err(Error::MissingEvent(c)) => assert_eq!(c, event.cid),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_winner_concurrent_tiebreak() {
        let store = MemStore::new();
        let base = append(&store, vec![], put("k", "base")).await;
        let left = append(&store, vec![base.cid], put("k", "left")).await;
        let right = append(&store, vec![base.cid], put("k", "right")).await;
        let head = canonical(vec![left.cid, right.cid]);

        let expect = if left.cid.to_bytes() > right.cid.to_bytes() {
            &left
        } else {
            &right
        };
        let won = winner(&store, "k", &head).await.unwrap().unwrap();
        assert_eq!(won.cid, expect.cid);
    }

    #[tokio::test]
    async fn test_winner_causal_beats_cid() {
        let store = MemStore::new();
        let base = append(&store, vec![], put("k", "old")).await;
        let newer = append(&store, vec![base.cid], put("k", "new")).await;
        // the causally-later write wins even if its cid bytes are lower
        let won = winner(&store, "k", &[newer.cid]).await.unwrap().unwrap();
        assert_eq!(won.cid, newer.cid);
        assert!(winner(&store, "missing", &[newer.cid])
            .await
            .unwrap()
            .is_none());
    }
}
