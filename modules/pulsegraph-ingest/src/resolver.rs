use pulsegraph_common::{CanonicalPost, PostRecord};

/// Decide the identity a raw record is stored under.
///
/// A repost takes over the id of the post it re-shares and drops its author,
/// since the repost's author did not write the original. Everything else
/// keeps its own id. The record itself is left untouched, so a collapsed
/// repost still carries its own creation date.
pub fn resolve(record: &PostRecord) -> CanonicalPost {
    match record.repost_target() {
        Some(target) => CanonicalPost {
            id: target.to_string(),
            author_id: None,
            derived: true,
            record: record.clone(),
        },
        None => CanonicalPost {
            id: record.id.clone(),
            author_id: record.author_id.clone(),
            derived: false,
            record: record.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{post, with_reference};
    use pulsegraph_common::ReferenceKind;

    #[test]
    fn plain_post_keeps_its_identity() {
        let record = post("1", "en", &["a"]);
        let canonical = resolve(&record);
        assert_eq!(canonical.id, "1");
        assert_eq!(canonical.author_id.as_deref(), Some("author-1"));
        assert!(!canonical.derived);
    }

    #[test]
    fn repost_collapses_onto_target() {
        let record = with_reference(post("10", "en", &["a"]), ReferenceKind::Repost, "5");
        let canonical = resolve(&record);
        assert_eq!(canonical.id, "5");
        assert_eq!(canonical.author_id, None);
        assert!(canonical.derived);
        assert_eq!(canonical.record.id, "10");
    }

    #[test]
    fn replies_and_quotes_keep_their_identity() {
        let reply = with_reference(post("11", "en", &[]), ReferenceKind::Reply, "5");
        let quote = with_reference(post("12", "en", &[]), ReferenceKind::Quote, "5");
        assert_eq!(resolve(&reply).id, "11");
        assert_eq!(resolve(&quote).id, "12");
        assert!(!resolve(&quote).derived);
    }

    #[test]
    fn repost_among_other_references_still_collapses() {
        let record = with_reference(
            with_reference(post("13", "en", &[]), ReferenceKind::Quote, "4"),
            ReferenceKind::Repost,
            "5",
        );
        assert_eq!(resolve(&record).id, "5");
    }

    #[test]
    fn collapsed_post_keeps_repost_date() {
        let record = with_reference(post("10", "en", &[]), ReferenceKind::Repost, "5");
        let node = resolve(&record).to_node();
        assert_eq!(node.date, record.created_on());
    }
}
