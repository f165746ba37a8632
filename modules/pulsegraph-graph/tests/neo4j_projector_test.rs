#![cfg(feature = "test-utils")]

// Projector behaviour against a real Neo4j.
//
// Requirements: Docker (for Neo4j via testcontainers)
//
// Run with: cargo test -p pulsegraph-graph --features test-utils --test neo4j_projector_test

use std::sync::Arc;

use chrono::Utc;
use pulsegraph_common::{
    AnnotationDomain, AnnotationEntity, CanonicalPost, ContextAnnotation, HashtagMention,
    PostEntities, PostRecord,
};
use pulsegraph_graph::{
    query, GraphClient, GraphProjector, GraphWriter, HashtagReader, KnownDomains, RetryPolicy,
};

async fn setup() -> (impl std::any::Any, GraphClient) {
    pulsegraph_graph::testutil::neo4j_container().await
}

fn projector(client: &GraphClient) -> GraphProjector {
    GraphProjector::new(
        Arc::new(GraphWriter::new(client.clone())),
        Arc::new(KnownDomains::new()),
        RetryPolicy::default(),
    )
}

fn post(id: &str, lang: &str, hashtags: &[&str], annotations: Vec<ContextAnnotation>) -> CanonicalPost {
    CanonicalPost {
        id: id.into(),
        author_id: Some("7".into()),
        derived: false,
        record: PostRecord {
            id: id.into(),
            text: format!("post {id}"),
            lang: lang.into(),
            created_at: Utc::now(),
            author_id: Some("7".into()),
            possibly_sensitive: false,
            references: vec![],
            entities: PostEntities {
                hashtags: hashtags
                    .iter()
                    .map(|t| HashtagMention { tag: t.to_string() })
                    .collect(),
            },
            context_annotations: annotations,
            raw: None,
        },
    }
}

fn annotation(domain: &str, description: &str, entity: &str, entity_name: &str) -> ContextAnnotation {
    ContextAnnotation {
        domain: AnnotationDomain {
            id: domain.into(),
            name: "Interests".into(),
            description: description.into(),
        },
        entity: AnnotationEntity {
            id: entity.into(),
            name: entity_name.into(),
        },
    }
}

async fn count(client: &GraphClient, cypher: &str) -> i64 {
    let mut stream = client.inner().execute(query(cypher)).await.expect("query failed");
    let row = stream.next().await.expect("stream failed").expect("no row");
    row.get::<i64>("n").expect("no count")
}

#[tokio::test]
async fn inserting_twice_creates_one_post_and_no_extra_edges() {
    let (_c, client) = setup().await;
    let projector = projector(&client);
    let p = post("1", "en", &["rust"], vec![annotation("66", "d", "847", "Rust")]);

    assert!(projector.insert(&p).await.unwrap());
    assert!(!projector.insert(&p).await.unwrap());

    assert_eq!(count(&client, "MATCH (p:Post {id: '1'}) RETURN count(p) AS n").await, 1);
    assert_eq!(count(&client, "MATCH (:Hashtag)-[r:USED_IN]->(:Post) RETURN count(r) AS n").await, 1);
    assert_eq!(count(&client, "MATCH (:Entity)-[r:MENTIONED_IN]->(:Post) RETURN count(r) AS n").await, 1);
}

#[tokio::test]
async fn domain_description_is_set_only_on_creation() {
    let (_c, client) = setup().await;

    projector(&client)
        .insert(&post("1", "en", &[], vec![annotation("66", "first", "847", "Rust")]))
        .await
        .unwrap();
    projector(&client)
        .insert(&post("2", "en", &[], vec![annotation("66", "second", "847", "Renamed")]))
        .await
        .unwrap();

    let mut stream = client
        .inner()
        .execute(query(
            "MATCH (d:Domain {id: '66'}), (e:Entity {id: '847'})
             RETURN d.description AS description, e.name AS name",
        ))
        .await
        .unwrap();
    let row = stream.next().await.unwrap().unwrap();
    assert_eq!(row.get::<String>("description").unwrap(), "first");
    assert_eq!(row.get::<String>("name").unwrap(), "Rust");
    assert_eq!(
        count(&client, "MATCH (:Entity {id: '847'})-[r:HAS_DOMAIN]->(:Domain) RETURN count(r) AS n").await,
        1
    );
}

#[tokio::test]
async fn concurrent_posts_sharing_a_hashtag_count_exactly() {
    let (_c, client) = setup().await;
    let projector = Arc::new(projector(&client));

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let projector = projector.clone();
            tokio::spawn(async move {
                projector
                    .insert(&post(
                        &format!("p{i}"),
                        "en",
                        &["foo"],
                        vec![annotation("66", "d", "847", "Rust")],
                    ))
                    .await
            })
        })
        .collect();
    for t in tasks {
        assert!(t.await.unwrap().unwrap());
    }

    let reader = HashtagReader::new(client.clone());
    assert_eq!(reader.hashtag_usage("foo").await.unwrap(), Some(20));
}

#[tokio::test]
async fn derived_posts_have_no_author() {
    let (_c, client) = setup().await;
    let mut p = post("99", "en", &["a"], vec![]);
    p.derived = true;
    p.author_id = None;

    projector(&client).insert(&p).await.unwrap();

    assert_eq!(
        count(
            &client,
            "MATCH (p:Post {id: '99'}) WHERE p.derived AND p.author_id IS NULL RETURN count(p) AS n"
        )
        .await,
        1
    );
}

#[tokio::test]
async fn reader_filters_by_language() {
    let (_c, client) = setup().await;
    let projector = projector(&client);
    projector.insert(&post("1", "en", &["a"], vec![])).await.unwrap();
    projector.insert(&post("2", "en", &["a", "b"], vec![])).await.unwrap();
    projector.insert(&post("3", "de", &["b", "c"], vec![])).await.unwrap();

    let reader = HashtagReader::new(client.clone());
    let top = reader.top_hashtags(10, Some("en"), Some(1)).await.unwrap();
    let names: Vec<_> = top.iter().map(|h| (h.name.as_str(), h.posts)).collect();
    assert_eq!(names, vec![("a", 2), ("b", 1)]);

    let similar = reader.similar_hashtags("b", None, None).await.unwrap();
    let names: Vec<_> = similar.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);
}
