use std::collections::BTreeMap;

use anyhow::anyhow;
use libipld::Ipld;

use tidepool::{Database, Error, Index, MemStore};

fn user(age: i128) -> Ipld {
    Ipld::Map(BTreeMap::from([("age".to_string(), Ipld::Integer(age))]))
}

fn by_age(db: &Database<MemStore>) -> Index<MemStore> {
    Index::new(db, |doc, emitter| {
        let age = doc
            .field("age")
            .ok_or_else(|| anyhow!("document has no age"))?;
        emitter.emit(age.clone(), Ipld::Null);
        Ok(())
    })
}

fn age_range(lo: i128, hi: i128) -> Option<(Ipld, Ipld)> {
    Some((Ipld::Integer(lo), Ipld::Integer(hi)))
}

#[tokio::test]
async fn test_query_by_emitted_key() {
    let db = tidepool::open(MemStore::new());
    let index = by_age(&db);

    db.put("u", user(20)).await.unwrap();
    let rows = index.query(age_range(20, 20)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "u");
    assert_eq!(rows[0].key, Ipld::Integer(20));
}

#[tokio::test]
async fn test_update_invalidates_prior_emission() {
    let db = tidepool::open(MemStore::new());
    let index = by_age(&db);

    db.put("u", user(20)).await.unwrap();
    assert_eq!(index.query(age_range(20, 20)).await.unwrap().len(), 1);

    db.put("u", user(30)).await.unwrap();
    assert!(index.query(age_range(20, 20)).await.unwrap().is_empty());
    let rows = index.query(age_range(30, 30)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "u");
}

#[tokio::test]
async fn test_range_spans_documents_in_key_order() {
    let db = tidepool::open(MemStore::new());
    let index = by_age(&db);

    db.put("alice", user(31)).await.unwrap();
    db.put("bob", user(27)).await.unwrap();
    db.put("carol", user(44)).await.unwrap();
    db.put("dave", user(27)).await.unwrap();

    let rows = index.query(age_range(25, 35)).await.unwrap();
    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    // ordered by emitted key, then doc id
    assert_eq!(ids, vec!["bob", "dave", "alice"]);

    let all = index.query(None).await.unwrap();
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn test_deleted_document_leaves_index() {
    let db = tidepool::open(MemStore::new());
    let index = by_age(&db);

    db.put("u", user(20)).await.unwrap();
    db.put("v", user(20)).await.unwrap();
    assert_eq!(index.query(age_range(20, 20)).await.unwrap().len(), 2);

    db.del("u").await.unwrap();
    let rows = index.query(age_range(20, 20)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "v");
}

#[tokio::test]
async fn test_multiple_emissions_per_document() {
    let db = tidepool::open(MemStore::new());
    let index = Index::new(&db, |doc, emitter| {
        if let Some(Ipld::List(tags)) = doc.field("tags") {
            for tag in tags {
                emitter.emit(tag.clone(), Ipld::String(doc.id.clone()));
            }
        }
        Ok(())
    });

    let doc = Ipld::Map(BTreeMap::from([(
        "tags".to_string(),
        Ipld::List(vec![
            Ipld::String("db".to_string()),
            Ipld::String("merkle".to_string()),
        ]),
    )]));
    db.put("post", doc).await.unwrap();

    let range = Some((
        Ipld::String("db".to_string()),
        Ipld::String("db".to_string()),
    ));
    assert_eq!(index.query(range.clone()).await.unwrap().len(), 1);

    // retag: the old emission must disappear
    let doc = Ipld::Map(BTreeMap::from([(
        "tags".to_string(),
        Ipld::List(vec![Ipld::String("merkle".to_string())]),
    )]));
    db.put("post", doc).await.unwrap();
    assert!(index.query(range).await.unwrap().is_empty());
    let range = Some((
        Ipld::String("merkle".to_string()),
        Ipld::String("merkle".to_string()),
    ));
    assert_eq!(index.query(range).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_map_error_leaves_index_unchanged() {
    let db = tidepool::open(MemStore::new());
    let index = by_age(&db);

    db.put("good", user(20)).await.unwrap();
    assert_eq!(index.query(age_range(0, 100)).await.unwrap().len(), 1);

    // a document the map function rejects
    db.put("bad", Ipld::Map(BTreeMap::new())).await.unwrap();
    assert!(matches!(
        index.query(age_range(0, 100)).await,
        Err(Error::IndexBuild(_))
    ));

    // the failed refresh left no partial state; removing the offender heals
    db.del("bad").await.unwrap();
    let rows = index.query(age_range(0, 100)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "good");
}

#[tokio::test]
async fn test_query_at_serves_history() {
    let db = tidepool::open(MemStore::new());
    let index = by_age(&db);

    db.put("u", user(20)).await.unwrap();
    index.query(None).await.unwrap();
    let old_root = index.root().await.unwrap();

    db.put("u", user(30)).await.unwrap();
    assert_eq!(index.query(age_range(30, 30)).await.unwrap().len(), 1);

    // the old root still answers with the old emission
    let rows = index.query_at(old_root, age_range(20, 20)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "u");
}
