use chrono::{Days, NaiveDate, Utc};
use neo4rs::query;
use serde::Serialize;

use crate::GraphClient;

/// Upper bound on any result size a caller can ask for.
pub const MAX_RESULTS: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashtagCount {
    pub name: String,
    pub posts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicCount {
    pub entity: String,
    pub posts: i64,
}

/// Read-only aggregations over the projected graph.
///
/// Filters are optional: an empty language or a missing day window matches
/// every post. Results are ordered by the number of matching posts.
#[derive(Clone)]
pub struct HashtagReader {
    client: GraphClient,
}

impl HashtagReader {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Most used hashtags, optionally restricted by language and a trailing day window.
    pub async fn top_hashtags(
        &self,
        limit: u32,
        lang: Option<&str>,
        last_days: Option<u32>,
    ) -> Result<Vec<HashtagCount>, neo4rs::Error> {
        let q = query(
            "MATCH (h:Hashtag)-[:USED_IN]->(p:Post)
             WHERE ($lang = '' OR p.lang = $lang)
               AND CASE WHEN $since = '' THEN true ELSE p.date > date($since) END
             WITH h, count(p) AS cnt
             RETURN h.name AS name, cnt
             ORDER BY cnt DESC, name ASC
             LIMIT $limit",
        )
        .param("lang", lang.unwrap_or(""))
        .param("since", since_param(last_days))
        .param("limit", clamp_limit(limit));

        self.collect_hashtags(q).await
    }

    /// Hashtags that appear on the same posts as `name`.
    pub async fn similar_hashtags(
        &self,
        name: &str,
        lang: Option<&str>,
        last_days: Option<u32>,
    ) -> Result<Vec<HashtagCount>, neo4rs::Error> {
        let q = query(
            "MATCH (h:Hashtag {name: $name})-[:USED_IN]->(p:Post)<-[:USED_IN]-(other:Hashtag)
             WHERE other <> h
               AND ($lang = '' OR p.lang = $lang)
               AND CASE WHEN $since = '' THEN true ELSE p.date > date($since) END
             WITH other, count(p) AS cnt
             RETURN other.name AS name, cnt
             ORDER BY cnt DESC, name ASC
             LIMIT 10",
        )
        .param("name", name)
        .param("lang", lang.unwrap_or(""))
        .param("since", since_param(last_days));

        self.collect_hashtags(q).await
    }

    /// Entities most often mentioned on posts that use `name`.
    pub async fn hashtag_topics(
        &self,
        name: &str,
        lang: Option<&str>,
    ) -> Result<Vec<TopicCount>, neo4rs::Error> {
        let q = query(
            "MATCH (h:Hashtag {name: $name})-[:USED_IN]->(p:Post)<-[:MENTIONED_IN]-(e:Entity)
             WHERE ($lang = '' OR p.lang = $lang)
             WITH e, count(p) AS cnt
             RETURN e.name AS entity, cnt
             ORDER BY cnt DESC, entity ASC
             LIMIT 10",
        )
        .param("name", name)
        .param("lang", lang.unwrap_or(""));

        let mut stream = self.client.graph.execute(q).await?;
        let mut topics = Vec::new();
        while let Some(row) = stream.next().await? {
            topics.push(TopicCount {
                entity: row.get::<String>("entity").unwrap_or_default(),
                posts: row.get::<i64>("cnt").unwrap_or_default(),
            });
        }
        Ok(topics)
    }

    /// The stored usage counter of a hashtag, if it exists.
    pub async fn hashtag_usage(&self, name: &str) -> Result<Option<i64>, neo4rs::Error> {
        let q = query("MATCH (h:Hashtag {name: $name}) RETURN h.count AS count").param("name", name);
        let mut stream = self.client.graph.execute(q).await?;
        Ok(match stream.next().await? {
            Some(row) => row.get::<i64>("count").ok(),
            None => None,
        })
    }

    async fn collect_hashtags(&self, q: neo4rs::Query) -> Result<Vec<HashtagCount>, neo4rs::Error> {
        let mut stream = self.client.graph.execute(q).await?;
        let mut hashtags = Vec::new();
        while let Some(row) = stream.next().await? {
            hashtags.push(HashtagCount {
                name: row.get::<String>("name").unwrap_or_default(),
                posts: row.get::<i64>("cnt").unwrap_or_default(),
            });
        }
        Ok(hashtags)
    }
}

fn clamp_limit(limit: u32) -> i64 {
    limit.min(MAX_RESULTS) as i64
}

/// `YYYY-MM-DD` of the first excluded day, or empty for no window.
fn since_param(last_days: Option<u32>) -> String {
    last_days
        .and_then(|days| since(Utc::now().date_naive(), days))
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn since(today: NaiveDate, days: u32) -> Option<NaiveDate> {
    today.checked_sub_days(Days::new(days as u64))
}
